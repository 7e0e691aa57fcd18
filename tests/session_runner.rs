//! Sessions driven through their task with a paused tokio clock.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::Instant;

use waav_session::core::session::{ResponseReason, ResponseStatus};
use waav_session::core::tools::ToolError;
use waav_session::{
    FnTool, InboundEvent, OutboundCommand, SessionConfig, SessionError, SessionHandle,
    SessionNotification, SessionOutput, SessionState, SessionStateMachine, ToolDefinition,
    TurnDetectionPolicy, spawn_session,
};

fn spawn(policy: TurnDetectionPolicy) -> (SessionHandle, mpsc::Receiver<SessionOutput>) {
    let machine = SessionStateMachine::new(
        "sess_runner",
        SessionConfig::default().with_turn_detection(policy),
    );
    let (handle, outputs, _task) = spawn_session(machine);
    (handle, outputs)
}

/// Next output matching `pred`, skipping the rest.
async fn wait_for<F>(outputs: &mut mpsc::Receiver<SessionOutput>, mut pred: F) -> SessionOutput
where
    F: FnMut(&SessionOutput) -> bool,
{
    let next = async {
        loop {
            match outputs.recv().await {
                Some(output) if pred(&output) => return output,
                Some(_) => continue,
                None => panic!("session ended before the expected output"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(120), next)
        .await
        .expect("timed out waiting for session output")
}

fn drain(outputs: &mut mpsc::Receiver<SessionOutput>) -> Vec<SessionOutput> {
    let mut drained = Vec::new();
    while let Ok(output) = outputs.try_recv() {
        drained.push(output);
    }
    drained
}

fn is_continuation(output: &SessionOutput) -> bool {
    matches!(
        output,
        SessionOutput::Command(OutboundCommand::RequestResponse {
            reason: ResponseReason::ToolContinuation,
            ..
        })
    )
}

fn definition(name: &str) -> ToolDefinition {
    ToolDefinition::new(name, "test tool", json!({"type": "object", "properties": {}}))
}

async fn start_response(handle: &SessionHandle, response_id: &str) {
    handle.request_response(None).await.unwrap();
    handle
        .send_event(InboundEvent::ResponseStarted {
            response_id: response_id.to_string(),
        })
        .await
        .unwrap();
}

async fn call_done(handle: &SessionHandle, response_id: &str, call_id: &str, name: &str) {
    handle
        .send_event(InboundEvent::ToolCallDone {
            response_id: response_id.to_string(),
            call_id: call_id.to_string(),
            name: Some(name.to_string()),
            arguments: "{}".to_string(),
        })
        .await
        .unwrap();
}

async fn response_done(handle: &SessionHandle, response_id: &str) {
    handle
        .send_event(InboundEvent::ResponseDone {
            response_id: response_id.to_string(),
            status: ResponseStatus::Completed,
        })
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_slow_tool_times_out() {
    let (handle, mut outputs) = spawn(TurnDetectionPolicy::Manual);
    let slow = FnTool::new(|_args: Value| async {
        tokio::time::sleep(Duration::from_secs(35)).await;
        Ok(json!("too late"))
    });
    handle
        .register_tool(definition("slow_lookup"), Arc::new(slow))
        .await
        .unwrap();

    start_response(&handle, "resp_1").await;
    let started = Instant::now();
    call_done(&handle, "resp_1", "call_1", "slow_lookup").await;
    response_done(&handle, "resp_1").await;

    let finished = wait_for(&mut outputs, |o| {
        matches!(o, SessionOutput::Notification(SessionNotification::ToolFinished { .. }))
    })
    .await;
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(30), "finished after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(31), "finished after {elapsed:?}");

    match finished {
        SessionOutput::Notification(SessionNotification::ToolFinished {
            success, payload, ..
        }) => {
            assert!(!success);
            assert_eq!(payload, json!({"error": "timeout", "timeout_ms": 30000}));
        }
        other => panic!("unexpected output {other:?}"),
    }

    // generation continues with the timeout recorded
    wait_for(&mut outputs, is_continuation).await;
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_call_done_invokes_handler_once() {
    let (handle, mut outputs) = spawn(TurnDetectionPolicy::Manual);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let tool = FnTool::new(move |_args: Value| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"ok": true}))
        }
    });
    handle
        .register_tool(definition("lookup"), Arc::new(tool))
        .await
        .unwrap();

    start_response(&handle, "resp_1").await;
    for fragment in ["{\"city\":", "\"Oslo\"}"] {
        handle
            .send_event(InboundEvent::ToolCallArgumentDelta {
                response_id: "resp_1".to_string(),
                call_id: "call_1".to_string(),
                name: Some("lookup".to_string()),
                delta: fragment.to_string(),
            })
            .await
            .unwrap();
    }
    call_done(&handle, "resp_1", "call_1", "lookup").await;
    call_done(&handle, "resp_1", "call_1", "lookup").await;
    response_done(&handle, "resp_1").await;

    wait_for(&mut outputs, is_continuation).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let finished = drain(&mut outputs)
        .into_iter()
        .filter(|o| {
            matches!(o, SessionOutput::Notification(SessionNotification::ToolFinished { .. }))
        })
        .count();
    assert_eq!(finished, 0);
}

#[tokio::test(start_paused = true)]
async fn test_parallel_tools_continue_once() {
    let (handle, mut outputs) = spawn(TurnDetectionPolicy::Manual);
    let weather = FnTool::new(|_args: Value| async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(json!({"temp_c": 18}))
    });
    let booking = FnTool::new(|_args: Value| async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Err(ToolError::Execution("no tables".to_string()))
    });
    handle
        .register_tool(definition("get_weather"), Arc::new(weather))
        .await
        .unwrap();
    handle
        .register_tool(definition("book_table"), Arc::new(booking))
        .await
        .unwrap();

    start_response(&handle, "resp_1").await;
    call_done(&handle, "resp_1", "call_a", "get_weather").await;
    call_done(&handle, "resp_1", "call_b", "book_table").await;
    response_done(&handle, "resp_1").await;

    let mut outcomes = Vec::new();
    loop {
        let output = wait_for(&mut outputs, |o| {
            is_continuation(o)
                || matches!(o, SessionOutput::Notification(SessionNotification::ToolFinished { .. }))
        })
        .await;
        match output {
            SessionOutput::Notification(SessionNotification::ToolFinished {
                call_id, success, ..
            }) => outcomes.push((call_id, success)),
            _ => break,
        }
    }
    outcomes.sort();
    assert_eq!(
        outcomes,
        vec![("call_a".to_string(), true), ("call_b".to_string(), false)]
    );

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!drain(&mut outputs).iter().any(is_continuation));
    assert_eq!(
        handle.snapshot().await.unwrap().state,
        SessionState::Processing
    );
}

#[tokio::test(start_paused = true)]
async fn test_silence_timer_fires_in_session_task() {
    let (handle, mut outputs) = spawn(TurnDetectionPolicy::Energy {
        threshold: 0.5,
        prefix_padding_ms: 300,
        silence_duration_ms: 500,
    });

    handle
        .send_event(InboundEvent::SpeechStarted {
            audio_start_ms: 0,
            item_id: None,
        })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1200)).await;
    handle
        .send_event(InboundEvent::SpeechStopped {
            audio_end_ms: 1200,
            item_id: None,
        })
        .await
        .unwrap();
    let stopped = Instant::now();

    wait_for(&mut outputs, |o| {
        matches!(
            o,
            SessionOutput::Command(OutboundCommand::RequestResponse {
                reason: ResponseReason::Turn,
                ..
            })
        )
    })
    .await;
    let waited = stopped.elapsed();
    assert!(waited >= Duration::from_millis(500), "waited {waited:?}");
    assert!(waited < Duration::from_millis(600), "waited {waited:?}");
}

#[tokio::test(start_paused = true)]
async fn test_unacknowledged_cancel_reports_fault() {
    let (handle, mut outputs) = spawn(TurnDetectionPolicy::default());

    start_response(&handle, "resp_1").await;
    handle
        .send_event(InboundEvent::ResponseAudioDelta {
            response_id: "resp_1".to_string(),
            item_id: "item_out".to_string(),
            audio: Bytes::from(vec![0u8; 48 * 800]),
            sample_rate: 24_000,
        })
        .await
        .unwrap();
    handle.audio_played("item_out", 300).await.unwrap();
    handle
        .send_event(InboundEvent::SpeechStarted {
            audio_start_ms: 0,
            item_id: None,
        })
        .await
        .unwrap();
    let interrupted = Instant::now();

    let truncate = wait_for(&mut outputs, |o| {
        matches!(o, SessionOutput::Command(OutboundCommand::TruncateItem { .. }))
    })
    .await;
    assert_eq!(
        truncate,
        SessionOutput::Command(OutboundCommand::TruncateItem {
            item_id: "item_out".to_string(),
            content_index: 0,
            audio_end_ms: 300,
        })
    );

    let fault = wait_for(&mut outputs, |o| {
        matches!(o, SessionOutput::Notification(SessionNotification::Error(_)))
    })
    .await;
    match fault {
        SessionOutput::Notification(SessionNotification::Error(fault)) => {
            assert_eq!(fault.code(), "cancellation_timeout")
        }
        other => panic!("unexpected output {other:?}"),
    }
    assert!(interrupted.elapsed() >= Duration::from_secs(2));
}

#[tokio::test]
async fn test_duplicate_registration_through_handle() {
    let (handle, _outputs) = spawn(TurnDetectionPolicy::Manual);
    let first = FnTool::new(|_args: Value| async { Ok(json!(1)) });
    let second = FnTool::new(|_args: Value| async { Ok(json!(2)) });

    handle
        .register_tool(definition("lookup"), Arc::new(first))
        .await
        .unwrap();
    let result = handle
        .register_tool(definition("lookup"), Arc::new(second))
        .await;
    assert_eq!(result, Err(SessionError::DuplicateTool("lookup".to_string())));
}

#[tokio::test]
async fn test_closed_session_rejects_operations() {
    let (handle, mut outputs) = spawn(TurnDetectionPolicy::Manual);
    handle.close().await.unwrap();

    wait_for(&mut outputs, |o| {
        matches!(o, SessionOutput::Notification(SessionNotification::Closed))
    })
    .await;
    assert_eq!(
        handle.request_response(None).await,
        Err(SessionError::SessionClosed)
    );
    assert!(handle.is_closed());
}
