//! End-to-end UD sessions over the software fabric.

use anyhow::Result;
use udverbs::prelude::*;
use udverbs::rdma::provider::Verb;
use udverbs::wire::{Grh, GRH_LEN, HEADER_LEN};

const DEPTH: usize = 20;
const MSG: usize = 512;

fn fabric() -> Result<SoftFabric> {
    Ok(SoftFabric::new()
        .with_device(SoftDevice::new("soft0", 1, "fe80::1".parse()?))
        .with_device(SoftDevice::new("soft1", 2, "fe80::2".parse()?)))
}

fn drain<P: Provider>(
    reaper: &mut CompletionReaper<'_, P>,
    ring: &mut RequestRing<'_, P>,
    max: usize,
) -> Result<Vec<Completion>> {
    Ok(reaper.poll(ring, max)?.to_vec())
}

#[test]
fn test_ring_stays_full() -> Result<()> {
    let fabric = fabric()?;
    let rx = TransportContext::open(&fabric, "soft0", DEPTH)?;
    let tx = TransportContext::open_sender(&fabric, "soft1", DEPTH, &rx.endpoint())?;

    let mut sends = RequestRing::sender(&tx, MSG)?;
    let mut reaper = CompletionReaper::new(&tx, DEPTH);
    sends.post_all()?;
    assert_eq!(sends.outstanding(), DEPTH);

    for k in [1, 5, 7, 20, 3] {
        let done = drain(&mut reaper, &mut sends, k)?;
        assert_eq!(done.len(), k);
        assert_eq!(sends.outstanding(), DEPTH - k);
        assert_eq!(sends.outstanding() + sends.available(), DEPTH);

        let reposted = sends.repost(done.iter().map(|c| c.slot))?;
        assert_eq!(reposted, k);
        assert_eq!(sends.outstanding(), DEPTH);
        assert_eq!(sends.available(), 0);
    }

    drop(reaper);
    drop(sends);
    tx.close()?;
    rx.close()?;
    assert!(fabric.live().is_empty());
    Ok(())
}

#[test]
fn test_payload_and_grh_arrive_intact() -> Result<()> {
    let fabric = fabric()?;
    let rx = TransportContext::open(&fabric, "soft0", DEPTH)?;
    let tx = TransportContext::open_sender(&fabric, "soft1", DEPTH, &rx.endpoint())?;

    let mut recvs = RequestRing::receiver(&rx, MSG)?;
    let mut rx_reaper = CompletionReaper::new(&rx, DEPTH);
    recvs.post_all()?;

    let mut sends = RequestRing::sender(&tx, MSG)?;
    for slot in 0..DEPTH {
        let buf = sends.payload_mut(slot).unwrap();
        for (i, b) in buf.iter_mut().enumerate() {
            *b = (slot * 7 + i) as u8;
        }
    }
    sends.post(0, 4)?;

    let done = drain(&mut rx_reaper, &mut recvs, DEPTH)?;
    assert_eq!(done.len(), 4);
    for (k, c) in done.iter().enumerate() {
        assert_eq!(c.slot, k);
        assert_eq!(c.payload_len(), MSG);
        assert_eq!(c.byte_len as usize, GRH_LEN + MSG);
        assert_eq!(c.src_qp, tx.qpn());

        let payload = recvs.payload(c.slot).unwrap();
        assert!(payload.iter().enumerate().all(|(i, &b)| b == (k * 7 + i) as u8));

        let grh = Grh::decode(recvs.header(c.slot).unwrap())?;
        assert_eq!(grh.ip_version, 6);
        assert_eq!(grh.next_header, 27);
        assert_eq!(grh.hop_limit, 1);
        assert_eq!(grh.sgid, tx.gid());
        assert_eq!(grh.dgid, rx.gid());
        assert_eq!(grh.payload_length as usize, MSG + 24);
    }

    // Slots still posted expose nothing.
    assert!(recvs.payload(DEPTH - 1).is_none());
    assert!(recvs.header(DEPTH - 1).is_none());
    Ok(())
}

#[test]
fn test_corrupted_frame_is_dropped() -> Result<()> {
    let fabric = fabric()?;
    let rx = TransportContext::open(&fabric, "soft0", DEPTH)?;
    let tx = TransportContext::open_sender(&fabric, "soft1", DEPTH, &rx.endpoint())?;

    let mut recvs = RequestRing::receiver(&rx, MSG)?;
    let mut rx_reaper = CompletionReaper::new(&rx, DEPTH);
    recvs.post_all()?;
    let mut sends = RequestRing::sender(&tx, MSG)?;
    let mut tx_reaper = CompletionReaper::new(&tx, DEPTH);

    // A payload bit: the frame still parses, only the CRC catches it.
    fabric.corrupt_next_frame((HEADER_LEN + 3) * 8 + 1);
    sends.post(0, 2)?;

    // UD gives no feedback: both sends succeed.
    assert_eq!(drain(&mut tx_reaper, &mut sends, DEPTH)?.len(), 2);
    let done = drain(&mut rx_reaper, &mut recvs, DEPTH)?;
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].slot, 0);

    let stats = fabric.stats();
    assert_eq!(stats.frames, 2);
    assert_eq!(stats.dropped_icrc, 1);
    assert_eq!(stats.delivered, 1);
    Ok(())
}

#[test]
fn test_unknown_device_allocates_nothing() -> Result<()> {
    let fabric = fabric()?;
    let err = TransportContext::open(&fabric, "mlx5_9", DEPTH).unwrap_err();
    assert!(matches!(
        err,
        TransportError::Config(ConfigError::DeviceNotFound(ref name)) if name == "mlx5_9"
    ));
    assert!(fabric.live().is_empty());
    Ok(())
}

#[test]
fn test_failed_completion_retires_slot() -> Result<()> {
    let fabric = fabric()?;
    let rx = TransportContext::open(&fabric, "soft0", DEPTH)?;
    let tx = TransportContext::open_sender(&fabric, "soft1", DEPTH, &rx.endpoint())?;

    let mut recvs = RequestRing::receiver(&rx, MSG)?;
    let mut rx_reaper = CompletionReaper::new(&rx, DEPTH);
    recvs.post_all()?;
    let mut sends = RequestRing::sender(&tx, MSG)?;

    fabric.fail_next_completion(WcStatus::LocProtErr);
    sends.post(0, 1)?;

    let err = rx_reaper.poll(&mut recvs, DEPTH).unwrap_err();
    assert!(matches!(
        err,
        CompletionError::Status {
            slot: 0,
            status: WcStatus::LocProtErr
        }
    ));
    assert_eq!(recvs.owner(0), SlotOwner::Faulted);
    assert_eq!(recvs.outstanding(), DEPTH - 1);
    assert_eq!(recvs.available(), 0);
    assert!(matches!(recvs.repost([0]), Err(PostError::SlotFaulted(0))));
    Ok(())
}

#[test]
fn test_short_post_reports_prefix() -> Result<()> {
    let fabric = fabric()?;
    let rx = TransportContext::open(&fabric, "soft0", DEPTH)?;
    let mut recvs = RequestRing::receiver(&rx, MSG)?;

    fabric.fail_nth(Verb::PostRecv, 6, libc::ENOMEM);
    let err = recvs.post(15, 10).unwrap_err();
    match err {
        PostError::Rejected {
            posted, requested, ..
        } => {
            assert_eq!(posted, 6);
            assert_eq!(requested, 10);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(recvs.outstanding(), 6);
    assert_eq!(recvs.owner(20 % DEPTH), SlotOwner::Hardware);
    assert_eq!(recvs.owner(21 % DEPTH), SlotOwner::Application);

    // The caller retries the remainder.
    recvs.post(21 % DEPTH, 4)?;
    assert_eq!(recvs.outstanding(), 10);
    Ok(())
}

#[test]
fn test_config_drives_a_session() -> Result<()> {
    let config = BenchConfig::from_toml_str(
        r#"
        [udverbs]
        device = "soft0"
        queue_depth = 8
        message_size = 128
        poll_batch = 8
        report_interval_ms = 0
        "#,
    )?;
    let fabric = fabric()?;
    let rx = TransportContext::open(&fabric, &config.device, config.queue_depth)?;
    let tx = TransportContext::open_sender(&fabric, "soft1", config.queue_depth, &rx.endpoint())?;

    let mut recv = RecvPump::new(
        RequestRing::receiver(&rx, config.message_size)?,
        CompletionReaper::new(&rx, config.poll_batch),
    );
    recv.start()?;
    let mut send = SendPump::new(
        RequestRing::sender(&tx, config.message_size)?,
        CompletionReaper::new(&tx, config.poll_batch),
    );
    send.fill_all(|slot, buf| buf.fill(slot as u8));
    send.start()?;

    let mut seen = Vec::new();
    let got = recv.step_with(|c, payload| {
        assert_eq!(payload.len(), 128);
        seen.push((c.slot, payload[0]));
    })?;
    assert_eq!(got.messages, 8);
    assert_eq!(seen, (0..8).map(|s| (s, s as u8)).collect::<Vec<_>>());
    assert_eq!(recv.ring().outstanding(), 8);
    Ok(())
}

#[test]
fn test_context_serves_one_ring() -> Result<()> {
    let fabric = fabric()?;
    let rx = TransportContext::open(&fabric, "soft0", DEPTH)?;
    let tx = TransportContext::open_sender(&fabric, "soft1", DEPTH, &rx.endpoint())?;

    let mut sends = RequestRing::sender(&tx, 64)?;
    let err = RequestRing::receiver(&tx, 64).err().unwrap();
    assert!(matches!(err, TransportError::Config(ConfigError::RingAttached)));

    sends.post(0, 1)?;
    let mut reaper = CompletionReaper::new(&tx, 4);
    let done = drain(&mut reaper, &mut sends, 4)?;
    assert_eq!(done.len(), 1);
    assert_eq!(sends.owner(0), SlotOwner::Application);
    Ok(())
}
