//! Built-in `manifest` handler: blake3 digest of every file of the input.

use anyhow::{Context, Result};
use blake3::Hasher;
use memmap2::Mmap;
use std::fs::File;
use std::io::Write;
use std::path::Path;

use crate::TaskInput;
use crate::utils::config::HashingConsts;

use super::executor::{ModuleHandler, TaskContext};

/// Hash a file with blake3. Uses memory-mapped I/O for files above threshold, chunked reading otherwise.
pub fn hash_file(path: &Path) -> Result<[u8; 32]> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let size = file.metadata()?.len();
    let mut hasher = Hasher::new();

    if size > HashingConsts::HASH_MMAP_THRESHOLD {
        let mmap = unsafe { Mmap::map(&file)? };
        hasher.update(&mmap);
    } else {
        use std::io::Read;
        let mut reader =
            std::io::BufReader::with_capacity(HashingConsts::HASH_READ_CHUNK_SIZE, file);
        let mut buffer = vec![0u8; HashingConsts::HASH_READ_CHUNK_SIZE];
        loop {
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }
    }

    Ok(*hasher.finalize().as_bytes())
}

fn hex(bytes: &[u8; 32]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Writes `<hex>  <path>` lines, one per file, sorted by path.
pub struct ManifestHandler;

impl ManifestHandler {
    pub const NAME: &'static str = "manifest";
    const DEFAULT_FILE: &'static str = "manifest.b3";
}

impl ModuleHandler for ManifestHandler {
    fn run(&self, ctx: &TaskContext) -> Result<()> {
        let mut files = match &ctx.input {
            TaskInput::File(p) => vec![p.clone()],
            TaskInput::Dir(d) => walkdir::WalkDir::new(d)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|r| r.ok())
                .filter(|e| e.file_type().is_file())
                .map(|e| e.into_path())
                .collect(),
        };
        files.sort();

        std::fs::create_dir_all(&ctx.output.output_dir)
            .with_context(|| format!("create {}", ctx.output.output_dir.display()))?;
        let name = match ctx.output.output_file.is_empty() {
            true => Self::DEFAULT_FILE,
            false => ctx.output.output_file.as_str(),
        };
        let out_path = ctx.output.output_dir.join(name);
        let mut out = std::io::BufWriter::new(
            File::create(&out_path).with_context(|| format!("create {}", out_path.display()))?,
        );
        for f in &files {
            let digest = hash_file(f)?;
            writeln!(out, "{}  {}", hex(&digest), f.display())?;
        }
        out.flush()?;
        log::debug!("manifest of {} files -> {}", files.len(), out_path.display());
        Ok(())
    }
}
