//! Serving associations over TCP.
mod common;

use std::sync::atomic::Ordering;

use common::*;
use dicom_dimse::association::AssociationState;
use dicom_dimse::message::{DicomRequest, Status};
use dicom_dimse::provider::Capabilities;
use dicom_dimse::server::DicomServer;
use dicom_dimse::service::DicomServiceBuilder;
use tokio::net::TcpStream;

#[tokio::test]
async fn server_serves_consecutive_connections() -> Result<()> {
    let echo = CountingEcho::default();
    let builder =
        DicomServiceBuilder::new().capabilities(Capabilities::new().with_c_echo(echo.clone()));
    let server = DicomServer::bind("127.0.0.1:0", builder).await?;
    let addr = server.local_addr()?;
    let handle = tokio::spawn(server.run(|_addr| acceptor_policy()));

    for _ in 0..3 {
        let stream = TcpStream::connect(addr).await?;
        let scu = DicomServiceBuilder::new()
            .request(stream, proposed_association(), ())
            .await?;
        let response = scu.send_request(DicomRequest::c_echo())?.last().await;
        assert_eq!(response.map(|r| r.status()), Some(Status::SUCCESS));
        scu.release().await?;
        assert_eq!(scu.state(), AssociationState::Closed);
    }

    assert_eq!(echo.count.load(Ordering::SeqCst), 3);
    handle.abort();
    Ok(())
}

#[tokio::test]
async fn accepted_connection_is_served() -> Result<()> {
    let builder = DicomServiceBuilder::new().capabilities(Capabilities::verification());
    let server = DicomServer::bind("127.0.0.1:0", builder).await?;
    let addr = server.local_addr()?;

    let client = tokio::spawn(async move {
        let stream = TcpStream::connect(addr).await?;
        let scu = DicomServiceBuilder::new()
            .request(stream, proposed_association(), ())
            .await?;
        let status = scu
            .send_request(DicomRequest::c_echo())?
            .last()
            .await
            .map(|r| r.status());
        scu.release().await?;
        Ok::<_, Box<dyn std::error::Error + Send + Sync>>(status)
    });

    let (scp, peer_addr) = server.accept(acceptor_policy()).await?;
    assert!(peer_addr.ip().is_loopback());
    assert_eq!(client.await??, Some(Status::SUCCESS));
    scp.wait_closed().await;
    let association = scp.association().expect("negotiated");
    assert_eq!(association.calling_ae_title(), SCU_AE_TITLE);
    assert_eq!(association.called_ae_title(), SCP_AE_TITLE);
    Ok(())
}
