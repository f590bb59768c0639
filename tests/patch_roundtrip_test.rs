use shipwright::bowl::{Bowl, DiscardBowl, FreshBowl, OverlayBowl, PoolBowl};
use shipwright::compress::{Compression, CompressionSettings};
use shipwright::container::Container;
use shipwright::delta::{
    compute_signature, BlockApplier, BlockDiffer, BlockLibrary, Operation, BLOCK_SIZE,
};
use shipwright::diff::{DiffContext, DiffOptions};
use shipwright::patcher::{Checkpoint, Patcher, ResumeOutcome, TimedSaveConsumer};
use shipwright::pool::{FsPool, MemPool, Pool};
use std::fs;
use std::io::Cursor;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// xorshift64*, enough to make blocks that never collide
fn random_bytes(seed: u64, len: usize) -> Vec<u8> {
    let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
    let mut out = Vec::with_capacity(len + 8);
    while out.len() < len {
        state ^= state >> 12;
        state ^= state << 25;
        state ^= state >> 27;
        out.extend_from_slice(&state.wrapping_mul(0x2545_F491_4F6C_DD1D).to_le_bytes());
    }
    out.truncate(len);
    out
}

fn write_file(root: &Path, rel: &str, data: &[u8]) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, data).unwrap();
}

/// Old and new trees covering renames, edits, additions and ghosts
fn setup_trees() -> (TempDir, TempDir) {
    let old = TempDir::new().unwrap();
    let new = TempDir::new().unwrap();

    let engine = random_bytes(1, 3 * BLOCK_SIZE + 1234);
    let textures = random_bytes(2, 200_000);
    let mut config = b"volume=7\nfullscreen=true\n".to_vec();

    write_file(old.path(), "bin/engine.dll", &engine);
    write_file(old.path(), "data/textures.pak", &textures);
    write_file(old.path(), "config.ini", &config);
    write_file(old.path(), "legacy/old/readme.txt", b"remove me");
    write_file(old.path(), "empty.txt", b"");

    // Renamed, byte-identical
    write_file(new.path(), "bin/engine-v2.dll", &engine);
    // Edited in the middle
    let mut patched = textures.clone();
    patched[100_000..100_500].copy_from_slice(&random_bytes(3, 500));
    write_file(new.path(), "data/textures.pak", &patched);
    // Small edit, suffix-diff territory
    config.extend_from_slice(b"vsync=false\n");
    write_file(new.path(), "config.ini", &config);
    write_file(new.path(), "data/new-level.bin", &random_bytes(4, 70_000));
    write_file(new.path(), "empty.txt", b"");
    fs::create_dir_all(new.path().join("saves")).unwrap();

    (old, new)
}

fn options(compression: Compression) -> DiffOptions {
    DiffOptions {
        compression: CompressionSettings {
            algorithm: compression,
            ..CompressionSettings::default()
        },
        partitions: 2,
        workers: 2,
        ..DiffOptions::default()
    }
}

fn make_patch(old: &Path, new: &Path, options: DiffOptions) -> (Vec<u8>, DiffContext) {
    let old_container = Container::walk(old).unwrap();
    let new_container = Container::walk(new).unwrap();
    let mut old_pool = FsPool::new(old_container.clone(), old);
    let signature = compute_signature(&old_container, &mut old_pool, BLOCK_SIZE).unwrap();

    let mut ctx = DiffContext::new(old_container, signature, new_container.clone(), options);
    let patch = ctx
        .write_patch(
            &mut FsPool::new(new_container, new),
            Some(&mut old_pool as &mut dyn Pool),
            Vec::new(),
        )
        .unwrap();
    (patch, ctx)
}

fn assert_trees_equal(expected: &Path, actual: &Path) {
    let want = Container::walk(expected).unwrap();
    let got = Container::walk(actual).unwrap();

    let paths = |c: &Container| -> Vec<(String, u64)> {
        c.files.iter().map(|f| (f.path.clone(), f.size)).collect()
    };
    assert_eq!(paths(&got), paths(&want));
    let dirs = |c: &Container| -> Vec<String> { c.dirs.iter().map(|d| d.path.clone()).collect() };
    assert_eq!(dirs(&got), dirs(&want));

    for file in &want.files {
        assert_eq!(
            fs::read(actual.join(&file.path)).unwrap(),
            fs::read(expected.join(&file.path)).unwrap(),
            "content of {}",
            file.path
        );
    }
}

#[test]
fn test_fresh_bowl_reproduces_new_tree() {
    let (old, new) = setup_trees();
    let (patch, ctx) = make_patch(old.path(), new.path(), options(Compression::Zstd));
    assert_eq!(ctx.stats().transpositions, 1);
    assert!(ctx.stats().suffix_files >= 1);

    let out = TempDir::new().unwrap();
    let mut patcher = Patcher::open(Cursor::new(patch)).unwrap();
    let mut bowl = FreshBowl::new(patcher.source_container().clone(), out.path()).unwrap();
    let mut target_pool = FsPool::new(patcher.target_container().clone(), old.path());
    let outcome = patcher.resume(None, &mut target_pool, &mut bowl).unwrap();
    assert_eq!(outcome, ResumeOutcome::Completed);
    bowl.commit().unwrap();

    assert_trees_equal(new.path(), out.path());
    assert_eq!(patcher.stats().transpositions, 1);
}

#[test]
fn test_overlay_bowl_updates_in_place() {
    let (old, new) = setup_trees();
    let (patch, _) = make_patch(old.path(), new.path(), options(Compression::Lz4));

    let stage = TempDir::new().unwrap();
    let mut patcher = Patcher::open(Cursor::new(patch)).unwrap();
    let mut bowl = OverlayBowl::new(
        patcher.target_container().clone(),
        patcher.source_container().clone(),
        old.path(),
        stage.path().join("stage"),
    )
    .unwrap();
    let mut target_pool = FsPool::new(patcher.target_container().clone(), old.path());
    patcher.resume(None, &mut target_pool, &mut bowl).unwrap();
    bowl.commit().unwrap();

    // Ghosts are gone: legacy/old/readme.txt, both legacy dirs, bin/engine.dll
    assert!(!old.path().join("legacy").exists());
    assert!(!old.path().join("bin/engine.dll").exists());
    assert!(bowl.leftover_dirs().is_empty());
    assert!(!stage.path().join("stage.commit.json").exists());
    assert_trees_equal(new.path(), old.path());

    // Committing again is harmless
    bowl.commit().unwrap();
    assert_trees_equal(new.path(), old.path());
}

#[test]
fn test_pool_and_discard_bowls() {
    let (old, new) = setup_trees();
    let (patch, _) = make_patch(old.path(), new.path(), options(Compression::None));

    let mut patcher = Patcher::open(Cursor::new(patch.clone())).unwrap();
    let source = patcher.source_container().clone();
    let mut bowl = PoolBowl::new(MemPool::with_len(source.files.len()));
    let mut target_pool = FsPool::new(patcher.target_container().clone(), old.path());
    patcher.resume(None, &mut target_pool, &mut bowl).unwrap();
    bowl.commit().unwrap();
    let output = bowl.into_inner();
    for (index, file) in source.files.iter().enumerate() {
        assert_eq!(
            output.contents(index).unwrap(),
            fs::read(new.path().join(&file.path)).unwrap(),
            "content of {}",
            file.path
        );
    }

    let before = Container::walk(old.path()).unwrap();
    let mut patcher = Patcher::open(Cursor::new(patch)).unwrap();
    let mut bowl = DiscardBowl::new();
    let mut target_pool = FsPool::new(patcher.target_container().clone(), old.path());
    patcher.resume(None, &mut target_pool, &mut bowl).unwrap();
    bowl.commit().unwrap();
    assert_eq!(bowl.transpositions(), 1);
    assert_eq!(Container::walk(old.path()).unwrap(), before);
}

#[test]
fn test_resumed_overlay_matches_uninterrupted_run() {
    let (old, new) = setup_trees();
    let (patch, _) = make_patch(old.path(), new.path(), options(Compression::Zstd));
    let stage = TempDir::new().unwrap();
    let stage_dir = stage.path().join("stage");

    let latest: Arc<Mutex<Option<Checkpoint>>> = Arc::new(Mutex::new(None));
    let mut sessions = 0;
    loop {
        sessions += 1;
        assert!(sessions < 1000, "patching never completed");

        let mut patcher = Patcher::open(Cursor::new(patch.clone())).unwrap();
        let sink = Arc::clone(&latest);
        let consumer = TimedSaveConsumer::new(Duration::ZERO, move |c: &Checkpoint| {
            *sink.lock().unwrap() = Some(c.clone());
            Ok(())
        })
        .stop_after(1);
        patcher.set_save_consumer(Box::new(consumer));

        let checkpoint = latest.lock().unwrap().clone();
        let mut bowl = OverlayBowl::new(
            patcher.target_container().clone(),
            patcher.source_container().clone(),
            old.path(),
            &stage_dir,
        )
        .unwrap();
        let mut target_pool = FsPool::new(patcher.target_container().clone(), old.path());
        let outcome = patcher
            .resume(checkpoint.as_ref(), &mut target_pool, &mut bowl)
            .unwrap();
        if outcome == ResumeOutcome::Completed {
            bowl.commit().unwrap();
            break;
        }
    }

    assert!(sessions > 5, "only {} sessions", sessions);
    assert_trees_equal(new.path(), old.path());
}

#[test]
fn test_truncated_patch_never_applies() {
    let (old, new) = setup_trees();
    let (patch, _) = make_patch(old.path(), new.path(), options(Compression::None));
    let target = Container::walk(old.path()).unwrap();

    let step = (patch.len() / 40).max(1);
    for cut in (0..patch.len()).step_by(step).chain([patch.len() - 1]) {
        let result = Patcher::open(Cursor::new(patch[..cut].to_vec())).and_then(|mut patcher| {
            patcher.resume(
                None,
                &mut FsPool::new(target.clone(), old.path()),
                &mut DiscardBowl::new(),
            )
        });
        match result {
            Ok(outcome) => panic!("cut at {} applied: {:?}", cut, outcome),
            Err(e) => assert!(e.is_corruption(), "cut at {}: {}", cut, e),
        }
    }
}

#[test]
fn test_patch_bytes_ignore_worker_count() {
    let (old, new) = setup_trees();
    let one = DiffOptions {
        workers: 1,
        ..options(Compression::Zstd)
    };
    let many = DiffOptions {
        workers: 8,
        ..options(Compression::Zstd)
    };
    let (first, _) = make_patch(old.path(), new.path(), one);
    let (second, _) = make_patch(old.path(), new.path(), many);
    assert_eq!(first, second);
}

#[test]
fn test_insert_in_large_file_costs_one_data_op() {
    let old = random_bytes(42, 10 * 1024 * 1024);
    let insert_at = 5 * 1024 * 1024;
    let mut new = old[..insert_at].to_vec();
    new.extend_from_slice(&random_bytes(43, 1024));
    new.extend_from_slice(&old[insert_at..]);

    let mut container = Container::new();
    container.push_file("game.bin", old.len() as u64);
    let mut pool = MemPool::new(vec![old]);
    let library = BlockLibrary::new(
        compute_signature(&container, &mut pool, BLOCK_SIZE).unwrap(),
        BLOCK_SIZE,
    );

    let ops: Vec<Operation> = BlockDiffer::new(new.as_slice(), &library, Some(0))
        .collect::<Result<_, _>>()
        .unwrap();
    let blocks_before = (insert_at / BLOCK_SIZE) as u64;
    assert_eq!(
        ops,
        vec![
            Operation::BlockRange {
                file_index: 0,
                block_index: 0,
                block_span: blocks_before,
            },
            Operation::Data(new[insert_at..insert_at + 1024].to_vec()),
            Operation::BlockRange {
                file_index: 0,
                block_index: blocks_before,
                block_span: blocks_before,
            },
        ]
    );

    let mut applier = BlockApplier::new(BLOCK_SIZE);
    let mut rebuilt = Vec::new();
    let mut written = 0;
    for op in &ops {
        written += applier.apply(op, &mut pool, &mut rebuilt).unwrap();
    }
    assert_eq!(written, new.len() as u64);
    assert_eq!(rebuilt, new);
}
