/*
Purpose: Link the Node binding against libtrecore.
Exports: None (build script only).
Role: Find the directory holding the built libtrecore for the N-API addon.
Invariants: TRECORE_LIB_DIR wins; otherwise the repo-local target/{debug,release}.
Notes: A candidate only counts when it actually contains a libtrecore artifact.
*/

use std::env;
use std::path::{Path, PathBuf};

const LIB_NAMES: [&str; 4] = [
    "libtrecore.so",
    "libtrecore.dylib",
    "libtrecore.a",
    "trecore.lib",
];

fn has_library(dir: &Path) -> bool {
    LIB_NAMES.iter().any(|name| dir.join(name).is_file())
}

fn main() {
    println!("cargo:rerun-if-env-changed=TRECORE_LIB_DIR");

    let crate_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR"));
    let repo_root = crate_dir
        .ancestors()
        .nth(3)
        .expect("bindings/node/native should be three levels below repo root")
        .to_path_buf();

    let mut candidates: Vec<PathBuf> = env::var_os("TRECORE_LIB_DIR")
        .map(PathBuf::from)
        .into_iter()
        .collect();
    candidates.push(repo_root.join("target").join("debug"));
    candidates.push(repo_root.join("target").join("release"));

    let Some(lib_dir) = candidates.into_iter().find(|dir| has_library(dir)) else {
        panic!("libtrecore not found; set TRECORE_LIB_DIR or run `cargo build` at the repo root");
    };

    println!("cargo:rustc-link-search=native={}", lib_dir.display());
    println!("cargo:rustc-link-lib=trecore");
}
