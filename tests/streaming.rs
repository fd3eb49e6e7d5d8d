mod common;

use std::sync::Arc;

use anyhow::Result;
use futures::StreamExt;
use tokio::sync::Notify;

use runvisor::eventlog::read_all;
use runvisor::schema::RUN_COMPLETED;
use runvisor::{Cursor, EventStream, RunError, RunRequest, RunStatus, StreamError};

use common::*;

async fn drain(mut stream: EventStream) -> Result<Vec<u64>> {
    let mut seqs = Vec::new();
    while let Some(item) = within(stream.next()).await {
        seqs.push(item?.sequence);
    }
    Ok(seqs)
}

fn steps_with_tables(gate: Option<Arc<Notify>>) -> Vec<Step> {
    let mut steps = vec![Step::Fact(fields(&["name"]))];
    if let Some(g) = gate {
        steps.push(Step::Gate(g));
    }
    for i in 0..5 {
        steps.push(Step::Text("progress"));
        steps.push(Step::Fact(table("a.xlsx", "S", i, "name")));
    }
    steps.push(Step::Fact(sheet_done("a.xlsx", "S")));
    steps.push(Step::Fact(finished_ok()));
    steps
}

#[tokio::test]
async fn finished_run_replays_and_ends_at_completion() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let svc = service(&dir, steps_with_tables(None), ScriptedBuild::fresh());
    let handle = svc.create_run(RunRequest::new("ws", "cfg")).await?;
    let record = within(svc.wait_for(&handle.run_id)).await?;
    let total = read_all(&record.events_path).await?.len() as u64;

    let seqs = drain(svc.stream_events(&handle.run_id, Cursor::START).await?).await?;
    assert_eq!(seqs, (1..=total).collect::<Vec<_>>());
    Ok(())
}

#[tokio::test]
async fn live_stream_sees_every_event_once() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let gate = Arc::new(Notify::new());
    let svc = service(&dir, steps_with_tables(Some(gate.clone())), ScriptedBuild::fresh());
    let handle = svc.create_run(RunRequest::new("ws", "cfg")).await?;

    let mut stream = svc.stream_events(&handle.run_id, Cursor::START).await?;
    let first = within(stream.next()).await.unwrap()?;
    assert_eq!(first.sequence, 1);
    assert_eq!(first.event_type, "run.queued");

    gate.notify_one();
    let mut seqs = vec![first.sequence];
    let mut last_type = String::new();
    while let Some(item) = within(stream.next()).await {
        let env = item?;
        seqs.push(env.sequence);
        last_type = env.event_type.clone();
    }
    assert_eq!(last_type, RUN_COMPLETED);

    let record = svc.get_run(&handle.run_id).await?;
    let total = read_all(&record.events_path).await?.len() as u64;
    assert_eq!(seqs, (1..=total).collect::<Vec<_>>());
    Ok(())
}

#[tokio::test]
async fn stream_open_across_cancellation_delivers_every_event() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut cfg = config(&dir);
    cfg.sync_log = true;
    let mut steps = vec![Step::Fact(fields(&["name"]))];
    for _ in 0..20 {
        steps.push(Step::Text("progress"));
    }
    steps.push(Step::Hang);
    let svc = service_with(cfg, steps, ScriptedBuild::fresh());
    let handle = svc.create_run(RunRequest::new("ws", "cfg")).await?;

    let mut stream = svc.stream_events(&handle.run_id, Cursor::START).await?;
    let mut seqs = Vec::new();
    while let Some(item) = within(stream.next()).await {
        let env = item?;
        seqs.push(env.sequence);
        if env.event_type == "engine.fields.declared" {
            break;
        }
    }

    // Cancel while console lines are still being appended.
    assert!(svc.cancel_run(&handle.run_id).await?);
    let mut last_type = String::new();
    while let Some(item) = within(stream.next()).await {
        let env = item?;
        seqs.push(env.sequence);
        last_type = env.event_type.clone();
    }
    assert_eq!(last_type, RUN_COMPLETED);

    let record = within(svc.wait_for(&handle.run_id)).await?;
    assert_eq!(record.status, RunStatus::Cancelled);
    let total = read_all(&record.events_path).await?.len() as u64;
    assert_eq!(seqs, (1..=total).collect::<Vec<_>>());
    Ok(())
}

#[tokio::test]
async fn resumed_stream_continues_without_gap_or_duplicate() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let gate = Arc::new(Notify::new());
    let svc = service(&dir, steps_with_tables(Some(gate.clone())), ScriptedBuild::fresh());
    let handle = svc.create_run(RunRequest::new("ws", "cfg")).await?;

    // First connection reads a prefix, then goes away.
    let mut stream = svc.stream_events(&handle.run_id, Cursor::START).await?;
    let mut seen = Vec::new();
    for _ in 0..3 {
        seen.push(within(stream.next()).await.unwrap()?.sequence);
    }
    let token = stream.cursor().token();
    drop(stream);

    gate.notify_one();
    let rest = drain(svc.resume_events(&handle.run_id, Some(&token)).await?).await?;
    seen.extend(rest);

    let record = within(svc.wait_for(&handle.run_id)).await?;
    let total = read_all(&record.events_path).await?.len() as u64;
    assert_eq!(seen, (1..=total).collect::<Vec<_>>());
    Ok(())
}

#[tokio::test]
async fn stream_adapter_yields_the_same_sequence() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let svc = service(&dir, steps_with_tables(None), ScriptedBuild::fresh());
    let handle = svc.create_run(RunRequest::new("ws", "cfg")).await?;
    within(svc.wait_for(&handle.run_id)).await?;

    let stream = svc.stream_events(&handle.run_id, Cursor::after(4)).await?;
    let envs: Vec<_> = within(stream.into_stream().collect::<Vec<_>>()).await;
    let seqs: Vec<u64> = envs.into_iter().map(|r| r.map(|e| e.sequence)).collect::<Result<_, _>>()?;
    assert_eq!(seqs.first(), Some(&5));
    assert!(seqs.windows(2).all(|w| w[1] == w[0] + 1));
    Ok(())
}

#[tokio::test]
async fn pages_cover_the_log_exactly() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let svc = service(&dir, steps_with_tables(None), ScriptedBuild::fresh());
    let handle = svc.create_run(RunRequest::new("ws", "cfg")).await?;
    let record = within(svc.wait_for(&handle.run_id)).await?;
    let total = read_all(&record.events_path).await?.len() as u64;

    let mut after = 0;
    let mut seqs = Vec::new();
    loop {
        let page = svc.events_page(&handle.run_id, after, 4).await?;
        assert!(page.events.len() <= 4);
        seqs.extend(page.events.iter().map(|e| e.sequence));
        after = page.next_after_sequence;
        if !page.has_more {
            break;
        }
    }
    assert_eq!(seqs, (1..=total).collect::<Vec<_>>());

    let empty = svc.events_page(&handle.run_id, total, 4).await?;
    assert!(empty.events.is_empty());
    assert!(!empty.has_more);
    assert_eq!(empty.next_after_sequence, total);
    Ok(())
}

#[tokio::test]
async fn bad_resume_token_is_rejected() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let svc = service(&dir, vec![Step::Fact(finished_ok())], ScriptedBuild::fresh());
    let handle = svc.create_run(RunRequest::new("ws", "cfg")).await?;
    within(svc.wait_for(&handle.run_id)).await?;

    let err = svc
        .resume_events(&handle.run_id, Some("not-a-token"))
        .await
        .err()
        .unwrap();
    assert!(matches!(
        err,
        RunError::Stream(StreamError::InvalidCursor { .. })
    ));
    Ok(())
}
