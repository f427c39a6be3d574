mod common;

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use asha_sync::SyncError;
use asha_sync::mesh::{
	ExchangeConfig, FramedPeerLink, MemoryPeerLink, PeerAdvert, PeerExchange, PeerId,
	StaticDiscovery, serve_peer_connection,
};
use asha_sync::model::{ActorId, ManualClock, RecordId, RecordKind};
use asha_sync::persist::MemoryStateStore;
use asha_sync::sync::{MemoryAuthority, OfflineTransport, SyncEngine};
use common::{device, device_with_store, fields, test_config};

async fn paired(
	engine: SyncEngine,
	me: &str,
	others: &[&str],
	clock: &ManualClock,
) -> PeerExchange {
	let exchange = PeerExchange::new(
		engine,
		PeerId::from(me),
		ExchangeConfig::default(),
		Arc::new(clock.clone()),
	);
	let adverts = others.iter().map(|p| PeerAdvert::new(*p, 90)).collect();
	exchange.discover(&StaticDiscovery::new(adverts)).await.unwrap();
	for other in others {
		exchange.mark_trusted(&PeerId::from(*other)).await.unwrap();
	}
	exchange
}

fn medications(engine: &SyncEngine) -> serde_json::Value {
	engine
		.get_record(&RecordId::from("P1"))
		.unwrap()
		.field("medications")
		.cloned()
		.unwrap_or_default()
}

/// Two devices start from the same synced list and each add a drug offline.
async fn diverged_medication_lists(
	clock: &ManualClock,
) -> (Arc<MemoryAuthority>, SyncEngine, SyncEngine) {
	let authority = Arc::new(MemoryAuthority::with_clock(Arc::new(clock.clone())));
	authority
		.write(
			&RecordId::from("P1"),
			RecordKind::Patient,
			fields(&[("medications", json!(["Aspirin"]))]),
			&ActorId::from("hq"),
		)
		.unwrap();
	let a = device("asha-a", authority.clone(), clock, test_config(true)).await;
	let b = device("asha-b", authority.clone(), clock, test_config(true)).await;
	a.run_cycle().await.unwrap();
	b.run_cycle().await.unwrap();

	a.edit(
		&RecordId::from("P1"),
		RecordKind::Patient,
		fields(&[("medications", json!(["Aspirin", "Metformin"]))]),
		None,
	)
	.await
	.unwrap();
	b.edit(
		&RecordId::from("P1"),
		RecordKind::Patient,
		fields(&[("medications", json!(["Aspirin", "Insulin"]))]),
		None,
	)
	.await
	.unwrap();
	(authority, a, b)
}

/// `+Metformin` on one device and `+Insulin` on the other end up as both.
#[tokio::test]
#[cfg(feature = "integration-tests")]
async fn test_medication_lists_merge_between_peers() -> Result<(), Box<dyn std::error::Error>> {
	let clock = ManualClock::new(10_000);
	let (authority, a, b) = diverged_medication_lists(&clock).await;
	let ex_a = paired(a.clone(), "asha-a", &["asha-b"], &clock).await;
	let ex_b = paired(b.clone(), "asha-b", &["asha-a"], &clock).await;

	let report = ex_a
		.exchange(&PeerId::from("asha-b"), Arc::new(MemoryPeerLink::new(ex_b.clone())))
		.await?;
	assert_eq!(report.sent, 1);
	assert_eq!(report.received, 1);
	assert_eq!(report.merge.auto_resolved, 1);

	let expected = json!(["Aspirin", "Insulin", "Metformin"]);
	assert_eq!(medications(&a), expected);
	assert_eq!(medications(&b), expected);
	assert!(a.list_conflicts().is_empty());
	assert!(b.list_conflicts().is_empty());

	// Both devices later reach the authority and settle on the same stamp.
	a.run_cycle().await?;
	b.run_cycle().await?;
	a.run_cycle().await?;
	b.run_cycle().await?;
	let id = RecordId::from("P1");
	assert_eq!(a.get_record(&id)?.stamps["medications"], b.get_record(&id)?.stamps["medications"]);
	assert_eq!(authority.record(&id).unwrap().field("medications"), Some(&expected));
	assert_eq!(a.list_pending_counts().unsynced(), 0);
	assert_eq!(b.list_pending_counts().unsynced(), 0);
	Ok(())
}

/// The same merge over a framed byte stream.
#[tokio::test]
#[cfg(feature = "integration-tests")]
async fn test_framed_link_carries_a_session() -> Result<(), Box<dyn std::error::Error>> {
	let clock = ManualClock::new(10_000);
	let (_authority, a, b) = diverged_medication_lists(&clock).await;
	let ex_a = paired(a.clone(), "asha-a", &["asha-b"], &clock).await;
	let ex_b = paired(b.clone(), "asha-b", &["asha-a"], &clock).await;

	let (client, server) = tokio::io::duplex(64 * 1024);
	let responder = tokio::spawn(serve_peer_connection(server, ex_b.clone()));
	let report = ex_a
		.exchange(&PeerId::from("asha-b"), Arc::new(FramedPeerLink::new(client)))
		.await?;
	assert_eq!(report.received, 1);
	tokio::time::timeout(Duration::from_secs(5), responder).await???;

	assert_eq!(medications(&a), medications(&b));
	assert_eq!(a.metrics().peer_exchanges_total.get(), 1);
	assert_eq!(b.metrics().peer_exchanges_total.get(), 1);
	assert_eq!(b.metrics().peer_deltas_received_total.get(), 1);
	Ok(())
}

/// Scalar edits made offline on two devices converge on the later write.
#[tokio::test]
#[cfg(feature = "integration-tests")]
async fn test_scalar_edits_converge_by_last_writer() -> Result<(), Box<dyn std::error::Error>> {
	let clock = ManualClock::new(10_000);
	let a = device("asha-a", Arc::new(OfflineTransport), &clock, test_config(true)).await;
	let b = device("asha-b", Arc::new(OfflineTransport), &clock, test_config(true)).await;
	let id = RecordId::from("P1");

	a.edit(&id, RecordKind::Patient, fields(&[("phone", json!("111"))]), None).await?;
	clock.advance(Duration::from_secs(1));
	b.edit(&id, RecordKind::Patient, fields(&[("phone", json!("222"))]), None).await?;

	let ex_a = paired(a.clone(), "asha-a", &["asha-b"], &clock).await;
	let ex_b = paired(b.clone(), "asha-b", &["asha-a"], &clock).await;
	ex_a.exchange(&PeerId::from("asha-b"), Arc::new(MemoryPeerLink::new(ex_b.clone())))
		.await?;
	assert_eq!(a.get_record(&id)?.field("phone"), Some(&json!("222")));
	assert_eq!(b.get_record(&id)?.field("phone"), Some(&json!("222")));

	// Exchanging again in the other direction changes no values.
	ex_b.exchange(&PeerId::from("asha-a"), Arc::new(MemoryPeerLink::new(ex_a.clone())))
		.await?;
	assert_eq!(a.get_record(&id)?.fields, b.get_record(&id)?.fields);
	assert_eq!(a.get_record(&id)?.stamps, b.get_record(&id)?.stamps);
	Ok(())
}

/// Three devices change the same phone number offline, 100 ms apart. Whatever
/// order they meet in, all of them end up with the last change.
#[tokio::test]
#[cfg(feature = "integration-tests")]
async fn test_three_devices_agree_in_any_order() -> Result<(), Box<dyn std::error::Error>> {
	let names = ["asha-a", "asha-b", "asha-c"];
	let orders = [[(0, 1), (0, 2), (1, 2)], [(1, 2), (0, 2), (0, 1)]];
	let id = RecordId::from("P1");

	for order in orders {
		let clock = ManualClock::new(10_000);
		let mut engines = Vec::new();
		for (i, name) in names.iter().enumerate() {
			clock.advance(Duration::from_millis(100));
			let engine = device(name, Arc::new(OfflineTransport), &clock, test_config(true)).await;
			let phone = json!(format!("98450-1000{i}"));
			engine.edit(&id, RecordKind::Patient, fields(&[("phone", phone)]), None).await?;
			engines.push(engine);
		}
		let mut exchanges = Vec::new();
		for (engine, me) in engines.iter().zip(names) {
			let others: Vec<&str> = names.iter().copied().filter(|n| *n != me).collect();
			exchanges.push(paired(engine.clone(), me, &others, &clock).await);
		}

		let expected = json!("98450-10002");
		for (from, to) in order {
			let link = Arc::new(MemoryPeerLink::new(exchanges[to].clone()));
			exchanges[from].exchange(&PeerId::from(names[to]), link).await?;
		}
		for engine in &engines {
			assert_eq!(engine.get_record(&id)?.field("phone"), Some(&expected), "order {order:?}");
		}

		// Further rounds only settle stamps; values stay put.
		for _ in 0..2 {
			for (from, to) in [(0, 1), (0, 2), (1, 2)] {
				let link = Arc::new(MemoryPeerLink::new(exchanges[to].clone()));
				exchanges[from].exchange(&PeerId::from(names[to]), link).await?;
			}
		}
		for engine in &engines {
			assert_eq!(engine.get_record(&id)?.field("phone"), Some(&expected), "order {order:?}");
			assert!(engine.list_conflicts().is_empty());
		}
	}
	Ok(())
}

/// A paired peer that walks out of range and comes back is still trusted.
#[tokio::test]
#[cfg(feature = "integration-tests")]
async fn test_pairing_survives_the_peer_going_away() -> Result<(), Box<dyn std::error::Error>> {
	let clock = ManualClock::new(10_000);
	let a = device("asha-a", Arc::new(OfflineTransport), &clock, test_config(true)).await;
	let b = device("asha-b", Arc::new(OfflineTransport), &clock, test_config(true)).await;
	let ex_a = paired(a.clone(), "asha-a", &["asha-b"], &clock).await;
	let ex_b = paired(b.clone(), "asha-b", &["asha-a"], &clock).await;

	clock.advance(Duration::from_secs(180));
	assert_eq!(ex_a.discover(&StaticDiscovery::default()).await?.count(), 0);
	let gone = ex_a
		.exchange(&PeerId::from("asha-b"), Arc::new(MemoryPeerLink::new(ex_b.clone())))
		.await
		.unwrap_err();
	assert!(matches!(gone, SyncError::UnknownPeer(_)));

	ex_a.discover(&StaticDiscovery::new(vec![PeerAdvert::new("asha-b", 70)])).await?;
	ex_b.discover(&StaticDiscovery::new(vec![PeerAdvert::new("asha-a", 70)])).await?;
	a.edit(&RecordId::from("P1"), RecordKind::Patient, fields(&[("phone", json!("111"))]), None)
		.await?;
	let report = ex_a
		.exchange(&PeerId::from("asha-b"), Arc::new(MemoryPeerLink::new(ex_b.clone())))
		.await?;
	assert_eq!(report.sent, 1);
	assert_eq!(b.get_record(&RecordId::from("P1"))?.field("phone"), Some(&json!("111")));
	Ok(())
}

/// Pairings are saved with the replica and come back after a restart.
#[tokio::test]
#[cfg(feature = "integration-tests")]
async fn test_pairing_survives_a_restart() -> Result<(), Box<dyn std::error::Error>> {
	let clock = ManualClock::new(10_000);
	let store = Arc::new(MemoryStateStore::new());
	let a = device_with_store("asha-a", Arc::new(OfflineTransport), &clock, store.clone()).await?;
	let b = device("asha-b", Arc::new(OfflineTransport), &clock, test_config(true)).await;
	paired(a, "asha-a", &["asha-b"], &clock).await;
	let ex_b = paired(b.clone(), "asha-b", &["asha-a"], &clock).await;

	let a = device_with_store("asha-a", Arc::new(OfflineTransport), &clock, store).await?;
	let ex_a = PeerExchange::new(
		a.clone(),
		PeerId::from("asha-a"),
		ExchangeConfig::default(),
		Arc::new(clock.clone()),
	);
	assert_eq!(ex_a.paired_peers(), vec![PeerId::from("asha-b")]);
	ex_a.discover(&StaticDiscovery::new(vec![PeerAdvert::new("asha-b", 70)])).await?;

	b.edit(&RecordId::from("P1"), RecordKind::Patient, fields(&[("phone", json!("222"))]), None)
		.await?;
	let report = ex_a
		.exchange(&PeerId::from("asha-b"), Arc::new(MemoryPeerLink::new(ex_b)))
		.await?;
	assert_eq!(report.received, 1);
	assert_eq!(a.get_record(&RecordId::from("P1"))?.field("phone"), Some(&json!("222")));
	Ok(())
}

/// A responder that has not paired with the caller refuses the handshake.
#[tokio::test]
#[cfg(feature = "integration-tests")]
async fn test_unpaired_responder_refuses_session() -> Result<(), Box<dyn std::error::Error>> {
	let clock = ManualClock::new(10_000);
	let a = device("asha-a", Arc::new(OfflineTransport), &clock, test_config(true)).await;
	let b = device("asha-b", Arc::new(OfflineTransport), &clock, test_config(true)).await;
	let ex_a = paired(a, "asha-a", &["asha-b"], &clock).await;
	let ex_b = paired(b, "asha-b", &[], &clock).await;

	let (client, server) = tokio::io::duplex(64 * 1024);
	let responder = tokio::spawn(serve_peer_connection(server, ex_b));
	let err = ex_a
		.exchange(&PeerId::from("asha-b"), Arc::new(FramedPeerLink::new(client)))
		.await
		.unwrap_err();
	assert!(matches!(err, SyncError::UntrustedPeer(_)));
	assert!(matches!(responder.await?, Err(SyncError::UnknownPeer(_))));
	Ok(())
}
