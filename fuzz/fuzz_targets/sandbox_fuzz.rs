#![no_main]
use libfuzzer_sys::fuzz_target;
use std::path::Path;
use tnfsd::modules::namespace::Namespace;

fuzz_target!(|data: &[u8]| {
    let dir = match tempfile::tempdir() {
        Ok(dir) => dir,
        Err(_) => return,
    };
    let root = dir.path().join("root");
    if std::fs::create_dir_all(root.join("a/b")).is_err() {
        return;
    }
    let _ = std::os::unix::fs::symlink(dir.path(), root.join("up"));

    let ns = match Namespace::new(&root) {
        Ok(ns) => ns,
        Err(_) => return,
    };
    if data.contains(&0) {
        return;
    }
    if let Ok(resolved) = ns.resolve(Path::new("a"), data) {
        // whatever resolves must stay inside the root
        assert!(resolved.starts_with(ns.root()), "{:?}", resolved);
    }
});
