use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

const FASTA: &str = "\
>human
ACGTACGTTAGCATCGATCGGATCCATGCAAGTC
>chimp
ACGTACGTTAGCATCGATCGGATCCATGCAAGTT
>gorilla
ACGTACGATAGCATCGATCAGATCCATGCTAGTT
>orangutan
ACGAACGATAGGATCGTTCAGATCGATGCTAGTA
>gibbon
ACGAACCATAGGATCGTTCAGTTCGATGGTAGTA
>macaque
TCGAACCATAGGTTCGTTCAGTTCGATGGTACTA
";

struct TestContext {
    _dir: TempDir,
    alignment: PathBuf,
}

impl TestContext {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let alignment = dir.path().join("apes.fasta");
        fs::write(&alignment, FASTA).unwrap();
        Self {
            _dir: dir,
            alignment,
        }
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        PathBuf::from(format!("{}{}", self.alignment.display(), suffix))
    }
}

fn phyloforge(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_phyloforge"))
        .args(args)
        .output()
        .expect("Failed to execute binary")
}

fn quick_search(alignment: &Path, extra: &[&str]) -> Output {
    let mut args = vec![
        "search",
        "-s",
        alignment.to_str().unwrap(),
        "--seed",
        "11",
        "--num-init-trees",
        "6",
        "--num-nni-trees",
        "3",
        "--num-support-trees",
        "3",
        "--pop-size",
        "2",
        "--max-iterations",
        "8",
        "--unsuccessful-iterations",
        "4",
    ];
    args.extend_from_slice(extra);
    phyloforge(&args)
}

fn best_score(stdout: &str) -> f64 {
    let re = Regex::new(r"Best score[^\n]*?(-?\d+\.\d{4})").unwrap();
    re.captures(stdout)
        .and_then(|c| c[1].parse().ok())
        .unwrap_or_else(|| panic!("no best score in output:\n{}", stdout))
}

#[test]
fn search_writes_a_named_treefile() {
    let ctx = TestContext::new();
    let output = quick_search(&ctx.alignment, &[]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success(), "{}", stdout);
    assert!(best_score(&stdout) < 0.0);

    let tree = fs::read_to_string(ctx.sibling(".treefile")).unwrap();
    assert!(tree.trim_end().ends_with(';'));
    for name in ["human", "chimp", "gorilla", "orangutan", "gibbon", "macaque"] {
        assert!(tree.contains(name), "{} missing from {}", name, tree);
    }
}

#[test]
fn in_process_workers_reach_the_same_kind_of_result() {
    let ctx = TestContext::new();
    let output = quick_search(&ctx.alignment, &["--workers", "2", "--no-checkpoint"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success(), "{}", stdout);
    assert!(best_score(&stdout) < 0.0);
    assert!(!ctx.sibling(".ckp.json").exists());
}

#[test]
fn inspect_summarises_the_checkpoint() {
    let ctx = TestContext::new();
    assert!(quick_search(&ctx.alignment, &[]).status.success());

    let checkpoint = ctx.sibling(".ckp.json");
    let output = phyloforge(&["inspect", checkpoint.to_str().unwrap()]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success(), "{}", stdout);
    assert!(stdout.contains("finished"));
    assert!(stdout.contains("TOP"));
}

#[test]
fn missing_alignment_is_reported() {
    let output = phyloforge(&["search", "-s", "/nonexistent/aln.phy"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("❌"));
}

#[test]
fn invalid_settings_fail_before_loading() {
    let ctx = TestContext::new();
    let output = quick_search(&ctx.alignment, &["--strength", "0"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("INVALID CONFIGURATION"));
}

#[test]
fn deletion_count_above_half_the_taxa_is_refused() {
    let ctx = TestContext::new();
    let output = quick_search(&ctx.alignment, &["--k-delete-min", "4"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("k-delete-min"), "{}", stderr);
    assert!(!ctx.sibling(".treefile").exists());
}
