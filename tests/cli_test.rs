use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

fn shipwright_bin() -> String {
    env!("CARGO_BIN_EXE_shipwright").to_string()
}

fn run(args: &[&str], config_home: &Path) -> Output {
    Command::new(shipwright_bin())
        .args(args)
        // Keep the user's config out of the tests
        .env("XDG_CONFIG_HOME", config_home)
        .env("HOME", config_home)
        .output()
        .unwrap()
}

fn arg(path: &Path) -> &str {
    path.to_str().unwrap()
}

fn pseudo_random(seed: u32, len: usize) -> Vec<u8> {
    let mut state = seed.wrapping_mul(2654435761) | 1;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state >> 16) as u8
        })
        .collect()
}

struct Fixture {
    dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let old = dir.path().join("v1");
        let new = dir.path().join("v2");
        fs::create_dir_all(old.join("assets")).unwrap();
        fs::create_dir_all(new.join("assets")).unwrap();
        fs::create_dir_all(old.join("obsolete")).unwrap();
        fs::create_dir_all(dir.path().join("config")).unwrap();

        let big = pseudo_random(1, 300_000);
        let mut edited = big.clone();
        edited[150_000..150_100].fill(0xAB);

        fs::write(old.join("assets/world.pak"), &big).unwrap();
        fs::write(old.join("game.exe"), pseudo_random(2, 90_000)).unwrap();
        fs::write(old.join("obsolete/notes.txt"), b"old notes").unwrap();

        fs::write(new.join("assets/world.pak"), &edited).unwrap();
        fs::write(new.join("game-renamed.exe"), pseudo_random(2, 90_000)).unwrap();
        fs::write(new.join("assets/intro.txt"), b"welcome back").unwrap();

        Self { dir }
    }

    fn path(&self, rel: &str) -> std::path::PathBuf {
        self.dir.path().join(rel)
    }

    fn run(&self, args: &[&str]) -> Output {
        run(args, &self.path("config"))
    }

    fn diff(&self) {
        let output = self.run(&[
            "diff",
            arg(&self.path("v1")),
            arg(&self.path("v2")),
            arg(&self.path("v1-v2.patch")),
            "--signature",
            arg(&self.path("v2.sig")),
        ]);
        assert!(
            output.status.success(),
            "diff failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }
}

fn assert_same_files(expected: &Path, actual: &Path) {
    for entry in walkdir::WalkDir::new(expected).min_depth(1) {
        let entry = entry.unwrap();
        let rel = entry.path().strip_prefix(expected).unwrap();
        let other = actual.join(rel);
        if entry.file_type().is_dir() {
            assert!(other.is_dir(), "missing dir {}", rel.display());
        } else {
            assert_eq!(
                fs::read(entry.path()).unwrap(),
                fs::read(&other).unwrap(),
                "content of {}",
                rel.display()
            );
        }
    }
    let count = |root: &Path| walkdir::WalkDir::new(root).min_depth(1).into_iter().count();
    assert_eq!(count(expected), count(actual));
}

#[test]
fn test_diff_and_apply_to_fresh_dir() {
    let fx = Fixture::new();
    fx.diff();
    assert!(fx.path("v1-v2.patch").is_file());
    assert!(fx.path("v2.sig").is_file());

    let output = fx.run(&[
        "apply",
        arg(&fx.path("v1-v2.patch")),
        arg(&fx.path("v1")),
        "--out",
        arg(&fx.path("out")),
    ]);
    assert!(
        output.status.success(),
        "apply failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Patch applied"));

    assert_same_files(&fx.path("v2"), &fx.path("out"));
}

#[test]
fn test_apply_in_place_with_checkpoints() {
    let fx = Fixture::new();
    fx.diff();

    let patch = fx.path("v1-v2.patch");
    let old = fx.path("v1");
    let checkpoint = fx.path("apply.checkpoint");
    let apply = |extra: &[&str]| {
        let mut args = vec![
            "apply",
            arg(&patch),
            arg(&old),
            "--in-place",
            "--checkpoint",
            arg(&checkpoint),
            "--checkpoint-interval",
            "0",
        ];
        args.extend_from_slice(extra);
        fx.run(&args)
    };

    // Interrupt twice, then finish
    for _ in 0..2 {
        let output = apply(&["--stop-after-checkpoints", "1"]);
        assert!(
            output.status.success(),
            "{}",
            String::from_utf8_lossy(&output.stderr)
        );
        assert!(checkpoint.exists());
        assert!(fx.path("v1/obsolete").exists(), "nothing commits before the end");
    }
    let output = apply(&[]);
    assert!(
        output.status.success(),
        "{}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(!checkpoint.exists());

    assert_same_files(&fx.path("v2"), &fx.path("v1"));
}

#[cfg(unix)]
#[test]
fn test_failed_in_place_commit_finishes_on_rerun() {
    let fx = Fixture::new();
    fx.diff();

    // A directory where a deleted file was makes the commit fail after the
    // renames have already happened
    let blocker = fx.path("v1/obsolete/notes.txt");
    fs::remove_file(&blocker).unwrap();
    fs::create_dir_all(blocker.join("inner")).unwrap();

    let patch = fx.path("v1-v2.patch");
    let old = fx.path("v1");
    let apply = || fx.run(&["apply", arg(&patch), arg(&old), "--in-place"]);

    let output = apply();
    assert!(!output.status.success());
    assert!(fx.path("v1/game-renamed.exe").exists());
    assert!(!fx.path("v1/game.exe").exists());

    // Patching again would read game.exe; only the commit is finished
    fs::remove_dir_all(&blocker).unwrap();
    let output = apply();
    assert!(
        output.status.success(),
        "{}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(String::from_utf8_lossy(&output.stdout).contains("interrupted commit"));
    assert_same_files(&fx.path("v2"), &fx.path("v1"));
    assert!(!fx.path(".v1.shipwright-stage.commit.json").exists());
}

#[test]
fn test_dry_run_leaves_tree_alone() {
    let fx = Fixture::new();
    fx.diff();

    let output = fx.run(&[
        "apply",
        arg(&fx.path("v1-v2.patch")),
        arg(&fx.path("v1")),
        "--dry-run",
    ]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("Dry-run"));
    assert!(fx.path("v1/obsolete/notes.txt").exists());
    assert!(!fx.path("v1/assets/intro.txt").exists());
}

#[test]
fn test_verify_against_signature() {
    let fx = Fixture::new();
    fx.diff();

    let output = fx.run(&["verify", arg(&fx.path("v2")), arg(&fx.path("v2.sig"))]);
    assert!(output.status.success());

    let mut damaged = fs::read(fx.path("v2/assets/world.pak")).unwrap();
    damaged[10] ^= 0xFF;
    fs::write(fx.path("v2/assets/world.pak"), damaged).unwrap();

    let output = fx.run(&["verify", arg(&fx.path("v2")), arg(&fx.path("v2.sig"))]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("assets/world.pak"), "{}", stderr);
}

#[test]
fn test_sign_then_verify() {
    let fx = Fixture::new();
    let sig = fx.path("v1.sig");
    let output = fx.run(&["sign", arg(&fx.path("v1")), arg(&sig)]);
    assert!(output.status.success());
    let output = fx.run(&["-q", "verify", arg(&fx.path("v1")), arg(&sig)]);
    assert!(output.status.success());
    assert!(output.stdout.is_empty());
}

#[test]
fn test_corrupt_patch_is_reported() {
    let fx = Fixture::new();
    fs::write(fx.path("bogus.patch"), b"definitely not a patch").unwrap();

    let output = fx.run(&[
        "apply",
        arg(&fx.path("bogus.patch")),
        arg(&fx.path("v1")),
        "--out",
        arg(&fx.path("out")),
    ]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Bad magic"));
}

#[test]
fn test_apply_without_mode_fails() {
    let fx = Fixture::new();
    fx.diff();
    let output = fx.run(&["apply", arg(&fx.path("v1-v2.patch")), arg(&fx.path("v1"))]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("--out"));
}
