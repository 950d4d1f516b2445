use std::path::Path;

use md5::Context;
use tokio::io::AsyncReadExt;

const READ_CHUNK: usize = 64 * 1024;

/// Lowercase hex MD5 of a local file, read in chunks.
pub async fn local_md5(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut ctx = Context::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        ctx.consume(&buf[..read]);
    }
    Ok(format!("{:x}", ctx.compute()))
}
