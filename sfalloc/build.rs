use std::env::{self, VarError};
use std::fs::File;
use std::io::Write;
use std::path::Path;

const POOL_SIZE_BYTES: usize = 4096;
const DEFAULT_ARENA_SIZE_BYTES: usize = 256 * 1024;
const MIN_ARENA_SIZE_BYTES: usize = 4 * POOL_SIZE_BYTES;
const MAX_ARENA_SIZE_BYTES: usize = 16 * 1024 * 1024;
const SFALLOC_ARENA_BYTES: &str = "SFALLOC_ARENA_BYTES";

fn main() {
    create_arena_size_bytes_file();
    export_rerun_rules();
}

fn create_arena_size_bytes_file() {
    let out_dir = env::var("OUT_DIR").expect("OUT_DIR environment variable not provided");
    let dest_path = Path::new(&out_dir).join("sfalloc_arena_size_bytes.txt");
    let size: usize = match env::var(SFALLOC_ARENA_BYTES) {
        Ok(s) => s
            .parse()
            .expect("Could not interpret SFALLOC_ARENA_BYTES as an unsigned integer"),
        Err(VarError::NotPresent) => DEFAULT_ARENA_SIZE_BYTES,
        Err(VarError::NotUnicode(_)) => {
            panic!("Could not interpret SFALLOC_ARENA_BYTES as a string representing an unsigned integer")
        }
    };
    assert!(
        size % POOL_SIZE_BYTES == 0,
        "SFALLOC_ARENA_BYTES must be a multiple of the {} byte pool size",
        POOL_SIZE_BYTES
    );
    assert!(
        (MIN_ARENA_SIZE_BYTES..=MAX_ARENA_SIZE_BYTES).contains(&size),
        "SFALLOC_ARENA_BYTES must be between {} and {} bytes",
        MIN_ARENA_SIZE_BYTES,
        MAX_ARENA_SIZE_BYTES
    );
    let mut f = File::create(&dest_path).expect("Could not create file to store sfalloc arena size metadata.");
    write!(f, "{}", size).expect("Could not write to sfalloc arena size metadata file");
    f.flush()
        .expect("Could not flush write to sfalloc arena size metadata file");
}

fn export_rerun_rules() {
    println!("cargo:rerun-if-env-changed={}", SFALLOC_ARENA_BYTES);
    for path in ["./Cargo.toml", "./build.rs", "./src/config.rs"].iter() {
        println!("cargo:rerun-if-changed={}", path);
    }
}
