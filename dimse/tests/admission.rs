//! Outgoing requests against the asynchronous operations window,
//! observed from a bare acceptor.
mod common;

use std::time::Duration;

use common::*;
use dicom_dimse::message::{DicomRequest, DicomResponse, Status};
use dicom_dimse::pdu::{Pdu, UserVariableItem};
use dicom_dimse::service::{DicomService, DicomServiceBuilder, Error, ServiceOptions};
use matches::assert_matches;

/// Associate an engine with a bare acceptor
/// which answers with the given user information.
async fn associate(
    options: ServiceOptions,
    user_variables: Vec<UserVariableItem>,
) -> Result<(DicomService, RawPeer, Vec<UserVariableItem>)> {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let mut peer = RawPeer::new(server);
    let requester = tokio::spawn(async move {
        DicomServiceBuilder::new()
            .options(options)
            .request(client, proposed_association(), ())
            .await
    });

    let rq = match peer.expect().await {
        Pdu::AssociationRQ(rq) => rq,
        pdu => panic!("expected A-ASSOCIATE-RQ, got {:?}", pdu),
    };
    peer.send(&Pdu::AssociationAC(accept_all(&rq, user_variables)))
        .await?;
    let scu = requester.await??;
    Ok((scu, peer, rq.user_variables))
}

async fn answer(peer: &mut RawPeer, request: &DicomRequest, status: Status) -> Result<()> {
    let response = DicomResponse::new(request, status);
    for pdu in message_pdus(response.message(), 1, 16_384) {
        peer.send(&pdu).await?;
    }
    Ok(())
}

async fn nothing_sent(peer: &mut RawPeer) -> bool {
    tokio::time::timeout(Duration::from_millis(200), peer.receive())
        .await
        .is_err()
}

#[tokio::test]
async fn single_operation_window_holds_back_requests() -> Result<()> {
    let (scu, mut peer, proposed) =
        associate(ServiceOptions::new(), vec![UserVariableItem::MaxLength(16_384)]).await?;
    // one operation at a time is the default, and is not proposed
    assert!(!proposed
        .iter()
        .any(|item| matches!(item, UserVariableItem::AsyncOperationsWindow { .. })));
    let association = scu.association().expect("negotiated");
    assert_eq!(association.max_async_ops_invoked(), 1);

    let first = scu.send_request(DicomRequest::c_echo())?;
    let second = scu.send_request(DicomRequest::c_echo())?;
    assert_ne!(first.message_id(), second.message_id());

    let request = request_of(peer.expect().await);
    assert_eq!(request.message_id(), Some(first.message_id()));
    assert!(nothing_sent(&mut peer).await);
    assert_eq!(scu.pending_message_ids(), vec![first.message_id()]);
    assert!(!scu.is_send_queue_empty());

    answer(&mut peer, &request, Status::SUCCESS).await?;
    let request = request_of(peer.expect().await);
    assert_eq!(request.message_id(), Some(second.message_id()));
    let response = first.last().await.expect("first response");
    assert_eq!(response.status(), Status::SUCCESS);

    answer(&mut peer, &request, Status::SUCCESS).await?;
    let response = second.last().await.expect("second response");
    assert_eq!(response.status(), Status::SUCCESS);
    assert!(scu.pending_message_ids().is_empty());

    let release = tokio::spawn({
        let scu = scu.clone();
        async move { scu.release().await }
    });
    assert_eq!(peer.expect().await, Pdu::ReleaseRQ);
    peer.send(&Pdu::ReleaseRP).await?;
    release.await??;
    Ok(())
}

#[tokio::test]
async fn negotiated_window_allows_pipelining() -> Result<()> {
    let (scu, mut peer, proposed) = associate(
        ServiceOptions::new().max_async_ops_invoked(4),
        vec![UserVariableItem::AsyncOperationsWindow {
            max_operations_invoked: 2,
            max_operations_performed: 1,
        }],
    )
    .await?;
    assert!(proposed.contains(&UserVariableItem::AsyncOperationsWindow {
        max_operations_invoked: 4,
        max_operations_performed: 4,
    }));
    assert_eq!(scu.association().expect("negotiated").max_async_ops_invoked(), 2);

    let receivers = (0..3)
        .map(|_| scu.send_request(DicomRequest::c_echo()))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let first = request_of(peer.expect().await);
    let second = request_of(peer.expect().await);
    assert_eq!(first.message_id(), Some(receivers[0].message_id()));
    assert_eq!(second.message_id(), Some(receivers[1].message_id()));
    assert!(nothing_sent(&mut peer).await);

    // answering out of order frees a slot all the same
    answer(&mut peer, &second, Status::SUCCESS).await?;
    let third = request_of(peer.expect().await);
    assert_eq!(third.message_id(), Some(receivers[2].message_id()));
    answer(&mut peer, &first, Status::SUCCESS).await?;
    answer(&mut peer, &third, Status::SUCCESS).await?;

    for receiver in receivers {
        let response = receiver.last().await.expect("response");
        assert_eq!(response.status(), Status::SUCCESS);
    }
    scu.abort().await;
    assert_matches!(peer.expect().await, Pdu::AbortRQ { .. });
    Ok(())
}

#[tokio::test]
async fn queued_request_is_cancelled_locally() -> Result<()> {
    let (scu, mut peer, _) = associate(ServiceOptions::new(), vec![]).await?;

    let first = scu.send_request(DicomRequest::c_echo().with_message_id(5))?;
    let second = scu.send_request(DicomRequest::c_echo().with_message_id(6))?;
    let request = request_of(peer.expect().await);
    assert_eq!(request.message_id(), Some(5));

    // message ID 5 awaits its response
    assert_matches!(
        scu.send_request(DicomRequest::c_echo().with_message_id(5)),
        Err(Error::MessageIdInUse { message_id: 5, .. })
    );

    scu.cancel(6)?;
    let response = second.last().await.expect("local response");
    assert_eq!(response.status(), Status::CANCEL);
    assert_eq!(response.request_message_id(), Some(6));

    answer(&mut peer, &request, Status::SUCCESS).await?;
    assert_eq!(first.last().await.map(|r| r.status()), Some(Status::SUCCESS));
    assert!(nothing_sent(&mut peer).await);
    Ok(())
}

#[tokio::test]
async fn cancel_of_outstanding_request_goes_to_the_peer() -> Result<()> {
    let (scu, mut peer, _) = associate(ServiceOptions::new(), vec![]).await?;

    let mut receiver = scu.send_request(DicomRequest::c_echo().with_message_id(7))?;
    let request = request_of(peer.expect().await);
    scu.cancel(7)?;

    // C-CANCEL bypasses the window, on the context of the cancelled request
    let cancel = command_message(peer.expect().await);
    assert_eq!(cancel.presentation_context_id(), Some(1));
    assert_eq!(cancel.message_id_being_responded_to(), Some(7));

    let pending = DicomResponse::new(&request, Status::PENDING);
    for pdu in message_pdus(pending.message(), 1, 16_384) {
        peer.send(&pdu).await?;
    }
    answer(&mut peer, &request, Status::CANCEL).await?;
    let response = receiver.next().await.expect("pending response");
    assert!(response.is_pending());
    let response = receiver.next().await.expect("final response");
    assert_eq!(response.status(), Status::CANCEL);
    assert!(receiver.next().await.is_none());
    Ok(())
}
