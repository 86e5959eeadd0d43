use std::io;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Concurrent bidirectional copy between two streams. EOF on one
/// direction half-closes the paired writer; the call returns once both
/// directions are finished, and both endpoints are shut down on every
/// exit path.
pub async fn splice<A, B>(mut a: A, mut b: B) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let result = tokio::io::copy_bidirectional(&mut a, &mut b).await;
    let _ = a.shutdown().await;
    let _ = b.shutdown().await;
    result
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn test_splice_propagates_half_close() {
        let (a_near, a_far) = tokio::io::duplex(1024);
        let (b_near, b_far) = tokio::io::duplex(1024);

        let task = tokio::spawn(splice(a_far, b_far));

        let (mut a_read, mut a_write) = tokio::io::split(a_near);
        let (mut b_read, mut b_write) = tokio::io::split(b_near);

        a_write.write_all(b"request").await.unwrap();
        a_write.shutdown().await.unwrap();

        let mut forwarded = Vec::new();
        b_read.read_to_end(&mut forwarded).await.unwrap();
        assert_eq!(forwarded, b"request");

        // The reverse direction still works after the half-close.
        b_write.write_all(b"response").await.unwrap();
        b_write.shutdown().await.unwrap();

        let mut returned = Vec::new();
        a_read.read_to_end(&mut returned).await.unwrap();
        assert_eq!(returned, b"response");

        let (to_b, to_a) = task.await.unwrap().unwrap();
        assert_eq!(to_b, 7);
        assert_eq!(to_a, 8);
    }

    #[tokio::test]
    async fn test_splice_survives_large_transfers_both_ways() {
        let (a_near, a_far) = tokio::io::duplex(256);
        let (b_near, b_far) = tokio::io::duplex(256);

        let task = tokio::spawn(splice(a_far, b_far));
        let payload = vec![0xa5u8; 64 * 1024];

        let up = {
            let payload = payload.clone();
            tokio::spawn(async move {
                let (mut read, mut write) = tokio::io::split(a_near);
                write.write_all(&payload).await.unwrap();
                write.shutdown().await.unwrap();
                let mut back = Vec::new();
                read.read_to_end(&mut back).await.unwrap();
                back
            })
        };

        let down = tokio::spawn(async move {
            let (mut read, mut write) = tokio::io::split(b_near);
            let mut seen = Vec::new();
            read.read_to_end(&mut seen).await.unwrap();
            write.write_all(&seen).await.unwrap();
            write.shutdown().await.unwrap();
            seen.len()
        });

        assert_eq!(down.await.unwrap(), payload.len());
        assert_eq!(up.await.unwrap(), payload);
        task.await.unwrap().unwrap();
    }
}
