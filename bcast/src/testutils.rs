use anyhow::{Context, Result};
use async_recursion::async_recursion;

/// Creates `root/weights` with more than 2.5 chunks of 4 KiB of file data:
///
/// weights
/// |- config.json
/// |- shards
///    |- 0.bin  (6000 bytes)
///    |- 1.bin  (6000 bytes)
/// |- empty
/// |- tokenizer
///    |- vocab.txt
///    |- merges.txt -> vocab.txt
pub async fn setup_source_tree(root: &std::path::Path) -> Result<std::path::PathBuf> {
    let weights = root.join("weights");
    tokio::fs::create_dir(&weights).await?;
    tokio::fs::write(weights.join("config.json"), r#"{"layers": 2}"#).await?;
    let shards = weights.join("shards");
    tokio::fs::create_dir(&shards).await?;
    let shard: Vec<u8> = (0..6000u32).map(|i| (i % 251) as u8).collect();
    tokio::fs::write(shards.join("0.bin"), &shard).await?;
    let reversed: Vec<u8> = shard.iter().rev().copied().collect();
    tokio::fs::write(shards.join("1.bin"), &reversed).await?;
    tokio::fs::create_dir(weights.join("empty")).await?;
    let tokenizer = weights.join("tokenizer");
    tokio::fs::create_dir(&tokenizer).await?;
    tokio::fs::write(tokenizer.join("vocab.txt"), "a\nb\nc\n").await?;
    tokio::fs::symlink("vocab.txt", tokenizer.join("merges.txt")).await?;
    Ok(weights)
}

/// Asserts `dst` holds the same entries as `src`, comparing file contents byte for byte.
#[async_recursion]
pub async fn check_dirs_identical(src: &std::path::Path, dst: &std::path::Path) -> Result<()> {
    let mut src_entries = tokio::fs::read_dir(src).await?;
    let mut count = 0;
    while let Some(src_entry) = src_entries.next_entry().await? {
        count += 1;
        let src_entry_path = src_entry.path();
        let dst_entry_path = dst.join(src_entry.file_name());
        let src_md = tokio::fs::symlink_metadata(&src_entry_path).await?;
        let dst_md = tokio::fs::symlink_metadata(&dst_entry_path)
            .await
            .with_context(|| format!("destination entry {dst_entry_path:?} is missing"))?;
        assert_eq!(src_md.file_type(), dst_md.file_type(), "{dst_entry_path:?}");
        if src_md.is_symlink() {
            assert_eq!(
                tokio::fs::read_link(&src_entry_path).await?,
                tokio::fs::read_link(&dst_entry_path).await?
            );
        } else if src_md.is_file() {
            let src_contents = tokio::fs::read(&src_entry_path).await?;
            let dst_contents = tokio::fs::read(&dst_entry_path).await?;
            assert!(src_contents == dst_contents, "{dst_entry_path:?} differs");
        } else {
            check_dirs_identical(&src_entry_path, &dst_entry_path).await?;
        }
    }
    let mut dst_entries = tokio::fs::read_dir(dst).await?;
    let mut dst_count = 0;
    while dst_entries.next_entry().await?.is_some() {
        dst_count += 1;
    }
    assert_eq!(count, dst_count, "{dst:?} has extra entries");
    Ok(())
}

/// Sum of the sizes of all regular files under `path`
#[async_recursion]
pub async fn tree_size(path: &std::path::Path) -> Result<u64> {
    let mut total = 0;
    let mut entries = tokio::fs::read_dir(path).await?;
    while let Some(entry) = entries.next_entry().await? {
        let metadata = tokio::fs::symlink_metadata(entry.path()).await?;
        if metadata.is_dir() {
            total += tree_size(&entry.path()).await?;
        } else if metadata.is_file() {
            total += metadata.len();
        }
    }
    Ok(total)
}
