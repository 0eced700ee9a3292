#![deny(warnings)]

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use rand::distributions::Uniform;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use structopt::StructOpt;

use shmtrie::{Geometry, PathFlags, SharedPathTrie};

#[derive(Debug, StructOpt)]
struct Backing {
    /// Status file
    #[structopt(parse(from_os_str))]
    status: PathBuf,

    /// Data file
    #[structopt(parse(from_os_str))]
    data: PathBuf,

    /// Initial data file size in bytes
    #[structopt(long = "initial-size")]
    initial_size: Option<usize>,

    /// Growth increment in bytes
    #[structopt(long = "expanding-size")]
    expanding_size: Option<usize>,
}

impl Backing {
    fn attach(&self) -> Arc<SharedPathTrie> {
        let default = Geometry::default();
        let geometry = Geometry {
            initial_file_size: self.initial_size.unwrap_or(default.initial_file_size),
            expanding_size: self.expanding_size.unwrap_or(default.expanding_size),
        };
        SharedPathTrie::attach_with(&self.status, &self.data, geometry)
            .expect("failed to attach trie")
    }
}

#[derive(Debug, StructOpt)]
#[structopt(about = "Command line tool to manage shmtrie file pairs.")]
enum Opt {
    /// Insert one path.
    #[structopt(name = "insert")]
    Insert {
        #[structopt(flatten)]
        backing: Backing,

        /// Path string to insert
        path: String,

        /// Comma-separated flags: allow,deny,violation,unknown,prefix
        #[structopt(
            short = "f",
            long = "flags",
            default_value = "allow",
            parse(try_from_str = parse_flags)
        )]
        flags: PathFlags,
    },

    /// Look one path up.
    #[structopt(name = "search")]
    Search {
        #[structopt(flatten)]
        backing: Backing,

        /// Path string to search
        path: String,
    },

    /// Bulk-insert newline-separated paths from a file.
    #[structopt(name = "load")]
    Load {
        #[structopt(flatten)]
        backing: Backing,

        /// File with one path per line
        #[structopt(parse(from_os_str))]
        list: PathBuf,

        /// Comma-separated flags applied to every path
        #[structopt(
            short = "f",
            long = "flags",
            default_value = "allow",
            parse(try_from_str = parse_flags)
        )]
        flags: PathFlags,
    },

    /// Multi-threaded random-path soak: insert, then verify every path.
    #[structopt(name = "stress")]
    Stress {
        #[structopt(flatten)]
        backing: Backing,

        #[structopt(short = "t", long = "threads", default_value = "4")]
        threads: u64,

        /// Paths inserted per thread
        #[structopt(short = "n", long = "paths", default_value = "1000")]
        paths: usize,

        #[structopt(long = "seed", default_value = "0")]
        seed: u64,
    },

    /// Print how much of the arena is in use.
    #[structopt(name = "stat")]
    Stat {
        #[structopt(flatten)]
        backing: Backing,
    },
}

fn main() {
    env_logger::init();
    let opt = Opt::from_args();

    match opt {
        Opt::Insert {
            backing,
            path,
            flags,
        } => {
            let trie = backing.attach();
            trie.insert(&path, flags).expect("failed to insert path");
        }
        Opt::Search { backing, path } => {
            let trie = backing.attach();
            match trie.search(&path).expect("failed to search path") {
                Some(flags) => println!("{}: {:?}", path, flags),
                None => {
                    println!("{}: not found", path);
                    std::process::exit(1);
                }
            }
        }
        Opt::Load {
            backing,
            list,
            flags,
        } => {
            let trie = backing.attach();
            let text = fs::read_to_string(&list).expect("failed to read path list");
            let mut inserted = 0usize;
            for line in text.lines().filter(|line| !line.is_empty()) {
                trie.insert(line, flags).expect("failed to insert path");
                inserted += 1;
            }
            println!("inserted {} paths, {} bytes used", inserted, trie.used_size());
        }
        Opt::Stress {
            backing,
            threads,
            paths,
            seed,
        } => {
            let trie = backing.attach();
            let alphabet = Uniform::new_inclusive(32u8, 122u8);

            let mut workers = Vec::new();
            for tid in 0..threads {
                let trie = trie.clone();
                workers.push(thread::spawn(move || -> Vec<String> {
                    let mut rng = StdRng::seed_from_u64(seed ^ tid);
                    (0..paths)
                        .map(|i| {
                            let len = rng.gen_range(8..64);
                            let tail: String =
                                (0..len).map(|_| rng.sample(alphabet) as char).collect();
                            let path = format!("/stress/{}/{}/{}", tid, i, tail);
                            trie.insert(&path, PathFlags::ALLOW)
                                .expect("failed to insert path");
                            path
                        })
                        .collect()
                }));
            }

            let mut total = 0usize;
            for worker in workers {
                for path in worker.join().expect("stress worker panicked") {
                    match trie.search(&path).expect("failed to search path") {
                        Some(_) => total += 1,
                        None => panic!("path lost after insert: {}", path),
                    }
                }
            }
            println!(
                "verified {} paths, {} bytes used",
                total,
                trie.used_size()
            );
        }
        Opt::Stat { backing } => {
            let trie = backing.attach();
            println!("{} bytes used", trie.used_size());
        }
    }
}

fn parse_flags(input: &str) -> Result<PathFlags, String> {
    let mut flags = PathFlags::empty();
    for name in input.split(',').filter(|name| !name.is_empty()) {
        flags |= match name {
            "allow" => PathFlags::ALLOW,
            "deny" => PathFlags::DENY,
            "violation" => PathFlags::SANDBOX_VIOLATION,
            "unknown" => PathFlags::SANDBOX_UNKNOWN,
            "prefix" => PathFlags::PREFIX,
            other => return Err(format!("unknown flag: {}", other)),
        };
    }
    Ok(flags)
}
