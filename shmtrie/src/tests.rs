use std::sync::Arc;
use std::thread;

use rand::distributions::Uniform;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

use crate::structs::{reserve_stride, CNODE_SIZE, INODE_SIZE};
use crate::{Geometry, PathFlags, Result, SharedPathTrie, TrieError};

const KB: usize = 1024;
const MB: usize = 1024 * 1024;

fn _new_trie_with(geometry: Geometry) -> (TempDir, Arc<SharedPathTrie>) {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let trie = SharedPathTrie::attach_with(
        dir.path().join("trie.status"),
        dir.path().join("trie.data"),
        geometry,
    )
    .expect("failed to attach trie");
    (dir, trie)
}

fn _new_trie() -> (TempDir, Arc<SharedPathTrie>) {
    // Small enough to keep test fixtures cheap, large enough that only the
    // growth tests ever expand.
    _new_trie_with(Geometry {
        initial_file_size: 4 * MB,
        expanding_size: MB,
    })
}

#[test]
fn attach_with_default_geometry() {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let trie = SharedPathTrie::attach(dir.path().join("s"), dir.path().join("d"))
        .expect("failed to attach with defaults");
    trie.insert("/etc/passwd", PathFlags::DENY)
        .expect("failed to insert");
    assert_eq!(
        trie.search("/etc/passwd").expect("search failed"),
        Some(PathFlags::DENY)
    );
}

#[test]
fn insert_then_search() -> Result<()> {
    let (_dir, trie) = _new_trie();
    trie.insert("/usr/bin/ls", PathFlags::ALLOW)?;

    assert_eq!(trie.search("/usr/bin/ls")?, Some(PathFlags::ALLOW));
    assert_eq!(trie.search("/usr/bin/cat")?, None);
    // Interior nodes of a stored path are not matches themselves.
    assert_eq!(trie.search("/usr/bin")?, None);
    assert_eq!(trie.search("/usr/bin/l")?, None);
    assert_eq!(trie.search("/usr/bin/lsx")?, None);
    Ok(())
}

#[test]
fn reinsert_overwrites_flags() -> Result<()> {
    let (_dir, trie) = _new_trie();
    trie.insert("/a", PathFlags::ALLOW)?;
    trie.insert("/a", PathFlags::DENY)?;
    assert_eq!(trie.search("/a")?, Some(PathFlags::DENY));
    Ok(())
}

#[test]
fn reinsert_is_idempotent() -> Result<()> {
    let (_dir, trie) = _new_trie();
    trie.insert("/usr/local/lib", PathFlags::ALLOW)?;
    let after_first = trie.used_size();
    trie.insert("/usr/local/lib", PathFlags::ALLOW)?;
    let after_second = trie.used_size();

    assert_eq!(trie.search("/usr/local/lib")?, Some(PathFlags::ALLOW));
    // The re-insert only rewrites the terminal node, and usually recycles
    // the CNode it just stranded.
    assert!(
        after_second - after_first <= reserve_stride(CNODE_SIZE),
        "double insert grew the arena by {} bytes",
        after_second - after_first
    );
    Ok(())
}

#[test]
fn prefix_matches_any_continuation() -> Result<()> {
    let (_dir, trie) = _new_trie();
    let flags = PathFlags::PREFIX | PathFlags::ALLOW;
    trie.insert("/tmp", flags)?;

    assert_eq!(trie.search("/tmp/a/b")?, Some(flags));
    assert_eq!(trie.search("/tmp")?, Some(flags));
    // A prefix is a path prefix, not a string prefix.
    assert_eq!(trie.search("/tmpx")?, None);
    Ok(())
}

#[test]
fn prefix_with_trailing_slash() -> Result<()> {
    let (_dir, trie) = _new_trie();
    let flags = PathFlags::PREFIX | PathFlags::ALLOW;
    // The trailing '/' is stripped so the node before it carries the bit.
    trie.insert("/bin/", flags)?;

    assert_eq!(trie.search("/bin")?, Some(flags));
    assert_eq!(trie.search("/bin/ls")?, Some(flags));
    assert_eq!(trie.search("/binx")?, None);
    Ok(())
}

#[test]
fn exact_insert_below_prefix() -> Result<()> {
    let (_dir, trie) = _new_trie();
    let prefix_flags = PathFlags::PREFIX | PathFlags::ALLOW;
    trie.insert("/bin", prefix_flags)?;
    trie.insert("/bin/ls", PathFlags::DENY)?;

    // The exact entry overrides the prefix for its own path only.
    assert_eq!(trie.search("/bin/ls")?, Some(PathFlags::DENY));
    assert_eq!(trie.search("/bin")?, Some(prefix_flags));
    Ok(())
}

#[test]
fn custom_icon_byte_is_skipped() -> Result<()> {
    let (_dir, trie) = _new_trie();
    trie.insert("ab\ric", PathFlags::ALLOW)?;

    assert_eq!(trie.search("abic")?, Some(PathFlags::ALLOW));
    assert_eq!(trie.search("\rabic")?, Some(PathFlags::ALLOW));
    assert_eq!(trie.search("ab\ric")?, Some(PathFlags::ALLOW));
    assert_eq!(trie.search("abc")?, None);
    Ok(())
}

#[test]
fn out_of_range_bytes_rejected() {
    let (_dir, trie) = _new_trie();
    assert_eq!(
        trie.insert("a\x1fb", PathFlags::ALLOW),
        Err(TrieError::OutOfRangeCharacter(0x1f))
    );
    assert_eq!(
        trie.insert("a{b", PathFlags::ALLOW),
        Err(TrieError::OutOfRangeCharacter(b'{'))
    );
    assert_eq!(
        trie.search("a\x7f"),
        Err(TrieError::OutOfRangeCharacter(0x7f))
    );
    // The failed inserts committed nothing searchable.
    assert_eq!(trie.search("a").expect("search failed"), None);
    assert_eq!(trie.search("ab").expect("search failed"), None);
}

#[test]
fn concurrent_disjoint_inserts() {
    let (_dir, trie) = _new_trie();
    let used_before = trie.used_size();

    let alphabet = Uniform::new_inclusive(32u8, 122u8);
    let mut workers = Vec::new();
    for tid in 0..8 {
        let trie = trie.clone();
        workers.push(thread::spawn(move || -> Vec<String> {
            let mut rng = StdRng::seed_from_u64(tid);
            let mut paths = Vec::new();
            for i in 0..200 {
                let len = rng.gen_range(4..24);
                let tail: String = (0..len).map(|_| rng.sample(alphabet) as char).collect();
                let path = format!("/w{}/{}/{}", tid, i, tail);
                trie.insert(&path, PathFlags::ALLOW).expect("insert failed");
                paths.push(path);
            }
            paths
        }));
    }

    for worker in workers {
        for path in worker.join().expect("worker panicked") {
            assert_eq!(
                trie.search(&path).expect("search failed"),
                Some(PathFlags::ALLOW),
                "lost path {}",
                path
            );
        }
    }
    assert!(trie.used_size() > used_before);
}

#[test]
fn concurrent_same_path_inserts() {
    let (_dir, trie) = _new_trie();
    let path = "/shared/contended/entry";
    let used_before = trie.used_size();

    let mut workers = Vec::new();
    for _ in 0..4 {
        let trie = trie.clone();
        workers.push(thread::spawn(move || {
            trie.insert(path, PathFlags::SANDBOX_UNKNOWN)
                .expect("insert failed");
        }));
    }
    for worker in workers {
        worker.join().expect("worker panicked");
    }

    assert_eq!(
        trie.search(path).expect("search failed"),
        Some(PathFlags::SANDBOX_UNKNOWN)
    );
    // All racers converge on one node chain. Losers recycle their stranded
    // copies, so even full lockstep stays well under one solo insert per
    // thread; normally the cost is a single solo insert.
    let per_char = reserve_stride(CNODE_SIZE) + reserve_stride(INODE_SIZE + CNODE_SIZE);
    let solo = path.len() * per_char + reserve_stride(CNODE_SIZE);
    assert!(
        trie.used_size() - used_before <= 3 * solo,
        "contended insert used {} bytes, solo bound is {}",
        trie.used_size() - used_before,
        solo
    );
}

#[test]
fn growth_keeps_existing_paths() -> Result<()> {
    let (_dir, trie) = _new_trie_with(Geometry {
        initial_file_size: 64 * KB,
        expanding_size: 64 * KB,
    });

    let mut paths = Vec::new();
    for i in 0..600 {
        let path = format!("/grown/{:04}", i);
        trie.insert(&path, PathFlags::ALLOW)?;
        paths.push(path);
    }

    // Enough arena use to force at least three growth steps.
    assert!(
        trie.used_size() > 64 * KB + 2 * 64 * KB,
        "only used {} bytes",
        trie.used_size()
    );
    for path in &paths {
        assert_eq!(trie.search(path)?, Some(PathFlags::ALLOW), "lost {}", path);
    }
    Ok(())
}

#[test]
fn reattach_preserves_contents() -> Result<()> {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let status = dir.path().join("trie.status");
    let data = dir.path().join("trie.data");

    let trie = SharedPathTrie::attach(&status, &data)?;
    trie.insert("/usr/bin/ls", PathFlags::ALLOW)?;
    let used = trie.used_size();
    drop(trie);

    let trie = SharedPathTrie::attach(&status, &data)?;
    assert_eq!(trie.search("/usr/bin/ls")?, Some(PathFlags::ALLOW));
    assert_eq!(trie.used_size(), used);
    Ok(())
}

#[test]
fn fd_reset_preserves_state() -> Result<()> {
    let (_dir, trie) = _new_trie();
    trie.insert("/var/log", PathFlags::SANDBOX_VIOLATION)?;

    let old_status_fd = trie.status_file_fd();
    let old_data_fd = trie.data_file_fd();
    trie.reset_fd()?;

    assert_ne!(trie.status_file_fd(), old_status_fd);
    assert_ne!(trie.data_file_fd(), old_data_fd);
    assert_eq!(
        trie.search("/var/log")?,
        Some(PathFlags::SANDBOX_VIOLATION)
    );
    trie.insert("/var/run", PathFlags::ALLOW)?;
    assert_eq!(trie.search("/var/run")?, Some(PathFlags::ALLOW));
    Ok(())
}

#[test]
fn visible_across_processes() {
    use nix::sys::wait::{waitpid, WaitStatus};
    use nix::unistd::{fork, ForkResult};

    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let status = dir.path().join("trie.status");
    let data = dir.path().join("trie.data");

    let trie = SharedPathTrie::attach(&status, &data).expect("parent attach failed");
    trie.insert("/seen/by/child", PathFlags::ALLOW)
        .expect("parent insert failed");

    match unsafe { fork() }.expect("fork failed") {
        ForkResult::Child => {
            // A fresh attach in the child, not the inherited mapping.
            let code = match SharedPathTrie::attach(&status, &data) {
                Ok(child_trie) => {
                    let inherited = child_trie.search("/seen/by/child")
                        == Ok(Some(PathFlags::ALLOW));
                    let written = child_trie
                        .insert("/seen/by/parent", PathFlags::DENY)
                        .is_ok();
                    if inherited && written {
                        0
                    } else {
                        1
                    }
                }
                Err(_) => 2,
            };
            std::process::exit(code);
        }
        ForkResult::Parent { child } => {
            match waitpid(child, None).expect("waitpid failed") {
                WaitStatus::Exited(_, 0) => {}
                other => panic!("child failed: {:?}", other),
            }
            assert_eq!(
                trie.search("/seen/by/parent").expect("search failed"),
                Some(PathFlags::DENY)
            );
        }
    }
}

#[test]
fn global_facade() {
    use crate::global;

    // Nothing is attached yet in this process.
    assert_eq!(global::status_file_fd(), -1);
    assert_eq!(global::data_file_fd(), -1);
    assert_eq!(global::used_size(), 0);
    assert_eq!(
        global::search("/anything"),
        Err(TrieError::NullManager)
    );
    // Resetting fds that do not exist is a successful no-op.
    global::reset_fd().expect("reset_fd before attach failed");

    let dir = tempfile::tempdir().expect("failed to create temp dir");
    global::attach(dir.path().join("s"), dir.path().join("d")).expect("attach failed");
    // Attaching again is a no-op success.
    global::attach(dir.path().join("other-s"), dir.path().join("other-d"))
        .expect("re-attach failed");

    global::insert("/opt/tool", PathFlags::ALLOW).expect("insert failed");
    assert_eq!(
        global::search("/opt/tool").expect("search failed"),
        Some(PathFlags::ALLOW)
    );
    assert!(global::status_file_fd() >= 0);
    assert!(global::data_file_fd() >= 0);
    assert!(global::used_size() > 0);

    let old = (global::status_file_fd(), global::data_file_fd());
    global::reset_fd().expect("reset_fd failed");
    assert_ne!((global::status_file_fd(), global::data_file_fd()), old);
    assert_eq!(
        global::search("/opt/tool").expect("search failed"),
        Some(PathFlags::ALLOW)
    );
}
