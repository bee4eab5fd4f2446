use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Pump bytes between two duplex channels until both directions are done.
///
/// Each direction copies until its source ends, then half-closes its
/// destination so the far side sees EOF; the other direction keeps flowing
/// until its own source ends too.
pub async fn pump<A, B>(a: A, b: B)
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let a_to_b = tokio::spawn(async move {
        let _ = tokio::io::copy(&mut a_read, &mut b_write).await;
        let _ = b_write.shutdown().await;
    });
    let b_to_a = tokio::spawn(async move {
        let _ = tokio::io::copy(&mut b_read, &mut a_write).await;
        let _ = a_write.shutdown().await;
    });

    let _ = tokio::join!(a_to_b, b_to_a);
}
