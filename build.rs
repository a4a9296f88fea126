//! Generates the allowlist of `MAILSHIFT_*` variables referenced in `src/`
//! and stamps a per-build id.

use std::collections::BTreeSet;
use std::error::Error;
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

const ENV_PREFIX: &str = "MAILSHIFT_";

fn visit_sources(dir: &Path, keys: &mut BTreeSet<String>) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            visit_sources(&path, keys)?;
        } else if path.extension().is_some_and(|ext| ext == "rs") {
            scan_env_keys(&fs::read_to_string(&path)?, keys);
        }
    }
    Ok(())
}

/// A key is the prefix plus an upper-case name that does not end in `_`.
fn scan_env_keys(source: &str, keys: &mut BTreeSet<String>) {
    for (start, _) in source.match_indices(ENV_PREFIX) {
        let rest = &source[start + ENV_PREFIX.len()..];
        let len = rest
            .bytes()
            .take_while(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || *b == b'_')
            .count();
        let name = &rest[..len];
        if !name.is_empty() && !name.ends_with('_') {
            keys.insert(format!("{ENV_PREFIX}{name}"));
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    let mut keys = BTreeSet::new();
    visit_sources(Path::new("src"), &mut keys)?;

    let entries: String = keys.iter().map(|key| format!("    \"{key}\",\n")).collect();
    let out_dir = std::env::var("OUT_DIR")?;
    fs::write(
        Path::new(&out_dir).join("mailshift_env_allowlist.rs"),
        format!("pub const GENERATED_ENV_ALLOWLIST: &[&str] = &[\n{entries}];\n"),
    )?;

    let now = SystemTime::now().duration_since(UNIX_EPOCH)?;
    println!(
        "cargo:rustc-env=BUILD_UUID={:x}-{:x}",
        now.as_secs(),
        now.subsec_nanos()
    );
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=src");
    Ok(())
}
