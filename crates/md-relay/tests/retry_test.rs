mod common;

use common::{fast_retry_config, harness, harness_on, harness_with, jid, wait_until_due};
use md_relay::{
    Credentials, Error, InMemoryStorage, Message, RelayConfig, RelayOptions, Result, RetryReceipt,
    RetryState, StorageAdapter,
};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

fn with_id(id: &str) -> RelayOptions {
    RelayOptions {
        message_id: Some(id.to_string()),
        ..Default::default()
    }
}

fn fast_harness() -> common::Harness {
    harness_with(
        Credentials::new(jid("100@s.whatsapp.net"), vec![1]),
        fast_retry_config(),
    )
}

#[test]
fn test_successful_send_leaves_queue_empty() -> Result<()> {
    let h = harness("100@s.whatsapp.net");
    let id = h
        .relay
        .send_message(&jid("200@s.whatsapp.net"), Message::text("hi"), RelayOptions::default())?;

    assert!(!h.relay.retry_queue().contains(&id));
    assert!(h.storage.list("v1/retry-queue/")?.is_empty());
    Ok(())
}

#[test]
fn test_network_failure_keeps_record_with_backoff() -> Result<()> {
    let h = harness("100@s.whatsapp.net");
    h.transport.fail_next_send(Error::Network("reset".to_string()));

    let err = h
        .relay
        .send_message(&jid("200@s.whatsapp.net"), Message::text("hi"), with_id("M1"))
        .unwrap_err();
    assert!(err.is_retryable());

    let record = h.relay.retry_queue().get("M1").unwrap();
    assert_eq!(record.attempt_count, 1);
    assert_eq!(record.state, RetryState::Active);
    assert!((5_000..=5_500).contains(&record.delay_ms), "{}", record.delay_ms);
    assert!(record.next_attempt_at >= record.created_at + record.delay_ms);
    assert_eq!(record.errors.len(), 1);
    assert!(h.storage.get("v1/retry-queue/M1")?.is_some());
    Ok(())
}

#[test]
fn test_protocol_failure_drops_record() {
    let h = harness("100@s.whatsapp.net");
    h.transport
        .push_error(Error::Protocol("bad usync reply".to_string()));

    let err = h
        .relay
        .send_message(&jid("200@s.whatsapp.net"), Message::text("hi"), with_id("M2"))
        .unwrap_err();
    assert!(!err.is_retryable());
    assert!(h.relay.retry_queue().is_empty());
}

#[test]
fn test_tick_redelivers_due_record() -> Result<()> {
    let h = fast_harness();
    h.transport.fail_next_send(Error::Network("reset".to_string()));
    let _ = h
        .relay
        .send_message(&jid("200@s.whatsapp.net"), Message::text("later"), with_id("M3"));
    assert!(h.transport.sent().is_empty());

    wait_until_due();
    let report = h.relay.run_retry_tick();

    assert_eq!(report.delivered, 1);
    assert_eq!(report.failed, 0);
    assert!(h.relay.retry_queue().is_empty());
    let stanza = h.transport.last_sent().unwrap();
    assert_eq!(stanza.attr("id"), Some("M3"));
    Ok(())
}

#[test]
fn test_tick_skips_record_acknowledged_mid_pass() {
    let h = fast_harness();
    let peer = jid("200@s.whatsapp.net");
    for id in ["A", "B"] {
        h.transport.fail_next_send(Error::Network("reset".to_string()));
        let _ = h.relay.send_message(&peer, Message::text(id), with_id(id));
    }
    assert_eq!(h.relay.retry_queue().len(), 2);

    let relay = Arc::downgrade(&h.relay);
    h.transport.on_send(move |stanza| {
        if stanza.attr("id") == Some("A") {
            if let Some(relay) = relay.upgrade() {
                relay.acknowledge("B").unwrap();
            }
        }
    });

    wait_until_due();
    let report = h.relay.run_retry_tick();

    assert_eq!(report.delivered, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(h.transport.sent().len(), 1);
    assert!(h.relay.retry_queue().is_empty());
}

#[test]
fn test_overlapping_ticks_deliver_once() {
    let h = fast_harness();
    h.transport.fail_next_send(Error::Network("reset".to_string()));
    let _ = h
        .relay
        .send_message(&jid("200@s.whatsapp.net"), Message::text("once"), with_id("M4"));
    wait_until_due();

    let delivered = Arc::new(Mutex::new(0));
    let workers: Vec<_> = (0..4)
        .map(|_| {
            let relay = h.relay.clone();
            let delivered = delivered.clone();
            thread::spawn(move || {
                let report = relay.run_retry_tick();
                *delivered.lock().unwrap() += report.delivered;
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(*delivered.lock().unwrap(), 1);
    assert_eq!(h.transport.sent().len(), 1);
}

#[test]
fn test_record_goes_inactive_after_max_attempts() {
    let h = fast_harness();
    let peer = jid("200@s.whatsapp.net");
    h.transport.fail_next_send(Error::Network("reset".to_string()));
    let _ = h.relay.send_message(&peer, Message::text("doomed"), with_id("M5"));

    for _ in 1..5 {
        wait_until_due();
        h.transport.fail_next_send(Error::Network("reset".to_string()));
        let report = h.relay.run_retry_tick();
        assert_eq!(report.failed, 1);
    }

    let record = h.relay.retry_queue().get("M5").unwrap();
    assert_eq!(record.attempt_count, 5);
    assert_eq!(record.state, RetryState::Inactive);
    assert!(record.inactive_since.is_some());

    wait_until_due();
    let report = h.relay.run_retry_tick();
    assert_eq!(report.delivered + report.failed, 0);
    assert!(h.transport.sent().is_empty());
}

#[test]
fn test_acknowledge_removes_record() -> Result<()> {
    let h = harness("100@s.whatsapp.net");
    h.transport.fail_next_send(Error::Network("reset".to_string()));
    let _ = h
        .relay
        .send_message(&jid("200@s.whatsapp.net"), Message::text("hi"), with_id("M6"));

    assert!(h.relay.acknowledge("M6")?);
    assert!(!h.relay.acknowledge("M6")?);
    assert!(h.storage.get("v1/retry-queue/M6")?.is_none());
    Ok(())
}

#[test]
fn test_persisted_queue_survives_restart() -> Result<()> {
    let storage = Arc::new(InMemoryStorage::new());
    let credentials = Credentials::new(jid("100@s.whatsapp.net"), vec![1]);
    {
        let h = harness_on(storage.clone(), credentials.clone(), RelayConfig::default());
        h.transport.fail_next_send(Error::Network("reset".to_string()));
        let _ = h
            .relay
            .send_message(&jid("200@s.whatsapp.net"), Message::text("hi"), with_id("M7"));
    }

    let h = harness_on(storage, credentials, RelayConfig::default());
    let record = h.relay.retry_queue().get("M7").unwrap();
    assert_eq!(record.attempt_count, 1);
    assert!(!record.in_flight);
    assert_eq!(record.message, Message::text("hi"));
    Ok(())
}

#[test]
fn test_scheduler_drains_queue_in_background() {
    let h = fast_harness();
    h.transport.fail_next_send(Error::Network("reset".to_string()));
    let _ = h
        .relay
        .send_message(&jid("200@s.whatsapp.net"), Message::text("bg"), with_id("M8"));

    h.relay.start();
    h.relay.start();
    assert!(h.relay.is_running());

    let deadline = Instant::now() + Duration::from_secs(5);
    while !h.relay.retry_queue().is_empty() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(h.relay.retry_queue().is_empty());
    assert_eq!(h.transport.sent().len(), 1);

    h.relay.stop();
    assert!(!h.relay.is_running());
}

#[test]
fn test_retry_receipt_resends_to_one_device_on_fresh_session() -> Result<()> {
    let h = harness("100@s.whatsapp.net");
    let peer = jid("200@s.whatsapp.net");
    h.transport.set_devices(&peer, &[0, 3]);
    let id = h.relay.relay(&peer, &Message::text("hi"), RelayOptions::default())?;
    assert_eq!(h.transport.queries_with_xmlns("encrypt").len(), 1);

    let receipt = RetryReceipt {
        message_id: id.clone(),
        remote_jid: peer.clone(),
        participant: Some(jid("200:3@s.whatsapp.net")),
        retry_count: 1,
    };
    assert!(h.relay.handle_retry_receipt(&receipt)?);

    let prekeys = h.transport.queries_with_xmlns("encrypt");
    assert_eq!(prekeys.len(), 2);
    assert_eq!(prekeys[1].find_all("user").len(), 1);

    let stanza = h.transport.last_sent().unwrap();
    assert_eq!(stanza.attr("id"), Some(id.as_str()));
    assert_eq!(stanza.attr("to"), Some("200:3@s.whatsapp.net"));
    assert_eq!(stanza.attr("device_fanout"), Some("false"));
    let enc = stanza.require_child("enc")?;
    assert_eq!(enc.attr("type"), Some("pkmsg"));
    assert_eq!(enc.attr("count"), Some("1"));
    assert!(stanza.child("device-identity").is_some());

    for _ in 2..=5 {
        assert!(h.relay.handle_retry_receipt(&receipt)?);
    }
    assert!(!h.relay.handle_retry_receipt(&receipt)?);
    Ok(())
}

#[test]
fn test_retry_receipt_for_unknown_message_is_ignored() -> Result<()> {
    let h = harness("100@s.whatsapp.net");
    let receipt = RetryReceipt {
        message_id: "3EB0UNKNOWN".to_string(),
        remote_jid: jid("200@s.whatsapp.net"),
        participant: None,
        retry_count: 2,
    };
    assert!(!h.relay.handle_retry_receipt(&receipt)?);
    assert!(h.transport.sent().is_empty());
    Ok(())
}
