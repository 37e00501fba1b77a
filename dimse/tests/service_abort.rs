//! Aborting a connection whose peer has stopped reading.
mod common;

use std::time::Duration;

use common::*;
use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::tags;
use dicom_dimse::association::AssociationState;
use dicom_dimse::message::DicomRequest;
use dicom_dimse::pdu::{Pdu, UserVariableItem};
use dicom_dimse::service::{
    DicomService, DicomServiceBuilder, Error, ResponseReceiver, ServiceOptions,
};
use matches::assert_matches;

const DEADLINE: Duration = Duration::from_secs(5);

/// Associate with a bare acceptor over a small pipe,
/// then start a large C-STORE which the acceptor never reads.
async fn stalled_requester() -> Result<(DicomService, RawPeer, ResponseReceiver)> {
    let (client, server) = tokio::io::duplex(4 * 1024);
    let mut peer = RawPeer::new(server);
    let requester = tokio::spawn(async move {
        DicomServiceBuilder::new()
            .options(ServiceOptions::new().max_pdus_in_queue(2))
            .request(client, proposed_association(), ())
            .await
    });

    let rq = match peer.expect().await {
        Pdu::AssociationRQ(rq) => rq,
        pdu => panic!("expected A-ASSOCIATE-RQ, got {:?}", pdu),
    };
    peer.send(&Pdu::AssociationAC(accept_all(
        &rq,
        vec![UserVariableItem::MaxLength(16_384)],
    )))
    .await?;
    let scu = requester.await??;

    let mut dataset = secondary_capture("1.2.826.0.1.3680043.2.1125.20");
    dataset.object_mut().put(DataElement::new(
        tags::PIXEL_DATA,
        VR::OB,
        PrimitiveValue::from(vec![0x55_u8; 4 * 1024 * 1024]),
    ));
    let receiver = scu.send_request(DicomRequest::c_store(dataset)?)?;

    // give the writer time to fill the pipe and the scheduler the queue
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(scu.state(), AssociationState::Established);
    assert!(!scu.is_send_queue_empty());
    Ok((scu, peer, receiver))
}

#[tokio::test]
async fn abort_does_not_wait_for_a_stalled_transport() -> Result<()> {
    let (scu, _peer, receiver) = stalled_requester().await?;

    tokio::time::timeout(DEADLINE, scu.abort())
        .await
        .expect("abort should return");
    assert_eq!(scu.state(), AssociationState::Closed);

    let last = tokio::time::timeout(DEADLINE, receiver.last())
        .await
        .expect("the request should end");
    assert!(last.is_none());
    assert_matches!(
        scu.send_request(DicomRequest::c_echo()),
        Err(Error::Closed { .. })
    );
    Ok(())
}

#[tokio::test]
async fn unrecognized_pdu_closes_a_stalled_connection() -> Result<()> {
    let (scu, mut peer, receiver) = stalled_requester().await?;

    peer.send_bytes(&[0x09, 0x00, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00])
        .await?;
    tokio::time::timeout(DEADLINE, scu.wait_closed())
        .await
        .expect("the connection should close");
    assert_eq!(scu.state(), AssociationState::Closed);

    let last = tokio::time::timeout(DEADLINE, receiver.last())
        .await
        .expect("the request should end");
    assert!(last.is_none());
    Ok(())
}
