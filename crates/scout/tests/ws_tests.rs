//! Channel integration tests: a real server on an ephemeral port and the
//! WebSocket client as the peer.

use std::time::Duration;

use scout::admission::Admission;
use scout::agent::{LoopEvent, ScriptStep, ScriptedLoop};
use scout::client::{ChannelClient, ClientError, TurnOutcome};
use scout::session::{Phase, TURN_IN_PROGRESS};
use scout_protocol::{Decoded, Event, TurnStatus, TurnUpdate, TurnView};
use serde_json::json;

mod common;
use common::{
    OTHER_MODEL, RawChannel, args, eventually, spawn_server, test_state, test_state_with,
};

const TIMEOUT: Duration = Duration::from_secs(5);

fn widget_script() -> ScriptedLoop {
    ScriptedLoop::from_events([
        LoopEvent::tool_invoked("web_search", args(json!({ "query": "widget X price" }))),
        LoopEvent::chunk("The price is..."),
        LoopEvent::Completed,
    ])
}

/// Streams two fragments and then waits to be stopped.
fn stalling_script() -> ScriptedLoop {
    ScriptedLoop::new(vec![
        ScriptStep::Emit(LoopEvent::chunk("first ")),
        ScriptStep::Emit(LoopEvent::chunk("second")),
        ScriptStep::Stall,
    ])
}

async fn recv_event(client: &mut ChannelClient) -> Event {
    match tokio::time::timeout(TIMEOUT, client.recv()).await {
        Ok(Ok(Some(Decoded::Event(event)))) => event,
        other => panic!("expected an event, got {other:?}"),
    }
}

async fn recv_closed(client: &mut ChannelClient) {
    match tokio::time::timeout(TIMEOUT, client.recv()).await {
        Ok(Ok(None)) | Ok(Err(_)) => {}
        other => panic!("expected the channel to close, got {other:?}"),
    }
}

#[tokio::test]
async fn test_widget_price_event_sequence() {
    let server = spawn_server(test_state(widget_script())).await;
    let mut client = ChannelClient::connect(&server.ws_url(), None).await.unwrap();

    client
        .send_query("find the current price of widget X")
        .await
        .unwrap();

    assert_eq!(recv_event(&mut client).await, Event::StartResponse);
    assert_eq!(
        recv_event(&mut client).await,
        Event::tool_start("web_search", args(json!({ "query": "widget X price" })), None)
    );
    assert_eq!(recv_event(&mut client).await, Event::stream("The price is..."));
    assert_eq!(recv_event(&mut client).await, Event::EndResponse);
}

#[tokio::test]
async fn test_widget_price_rendered_text() {
    let server = spawn_server(test_state(widget_script())).await;
    let mut client = ChannelClient::connect(&server.ws_url(), None).await.unwrap();

    let mut updates = Vec::new();
    let outcome = client
        .ask("find the current price of widget X", |_, update| {
            updates.push(update.clone())
        })
        .await
        .unwrap();

    assert_eq!(outcome, TurnOutcome::Completed("The price is...".to_string()));
    assert_eq!(
        updates,
        vec![
            TurnUpdate::Started,
            TurnUpdate::ToolStatus("searching for: `widget X price`".to_string()),
            TurnUpdate::Content("The price is...".to_string()),
            TurnUpdate::Completed,
        ]
    );
    assert_eq!(client.view().status(), TurnStatus::Idle);
    assert_eq!(client.view().tool_status(), None);
}

#[tokio::test]
async fn test_immediate_failure_reenables_input() {
    let agent = ScriptedLoop::from_events([LoopEvent::failed("rate limited")]);
    let server = spawn_server(test_state(agent)).await;
    let mut client = ChannelClient::connect(&server.ws_url(), None).await.unwrap();

    let mut updates = Vec::new();
    let outcome = client
        .ask("anything", |_, update| updates.push(update.clone()))
        .await
        .unwrap();

    assert_eq!(outcome, TurnOutcome::Failed("rate limited".to_string()));
    assert_eq!(
        updates,
        vec![
            TurnUpdate::Started,
            TurnUpdate::Failed("rate limited".to_string())
        ]
    );
    assert!(client.view().input_enabled());
    assert_eq!(client.view().text(), "");
}

#[tokio::test]
async fn test_cancel_by_closing_then_reconnect_with_clean_buffer() {
    let agent = stalling_script();
    let server = spawn_server(test_state(agent.clone())).await;

    let mut client = ChannelClient::connect(&server.ws_url(), None).await.unwrap();
    client.send_query("first query").await.unwrap();
    assert_eq!(recv_event(&mut client).await, Event::StartResponse);
    assert_eq!(recv_event(&mut client).await, Event::stream("first "));
    assert_eq!(recv_event(&mut client).await, Event::stream("second"));
    client.close().await.unwrap();

    // The server stops the loop and forgets the session.
    assert!(eventually(|| agent.stops_observed() == 1).await);
    assert!(eventually(|| server.state.sessions.is_empty()).await);

    let mut fresh = ChannelClient::connect(&server.ws_url(), None).await.unwrap();
    fresh.send_query("second query").await.unwrap();
    let mut view = TurnView::new();
    view.submit();
    for _ in 0..3 {
        view.apply(recv_event(&mut fresh).await);
    }
    assert_eq!(view.status(), TurnStatus::Streaming);
    assert_eq!(view.text(), "first second");
    assert_eq!(agent.started().len(), 2);
}

#[tokio::test]
async fn test_fresh_channel_text_excludes_cancelled_turn() {
    let agent = ScriptedLoop::new(vec![
        ScriptStep::Emit(LoopEvent::chunk("partial")),
        ScriptStep::Pause(Duration::from_millis(200)),
        ScriptStep::Emit(LoopEvent::Completed),
    ]);
    let server = spawn_server(test_state(agent)).await;

    let mut client = ChannelClient::connect(&server.ws_url(), None).await.unwrap();
    client.send_query("one").await.unwrap();
    assert_eq!(recv_event(&mut client).await, Event::StartResponse);
    assert_eq!(recv_event(&mut client).await, Event::stream("partial"));
    client.close().await.unwrap();

    let mut fresh = ChannelClient::connect(&server.ws_url(), None).await.unwrap();
    let outcome = tokio::time::timeout(TIMEOUT, fresh.ask("two", |_, _| {}))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome, TurnOutcome::Completed("partial".to_string()));
}

#[tokio::test]
async fn test_server_side_cancel_closes_channel() {
    let server = spawn_server(test_state(stalling_script())).await;
    let mut client = ChannelClient::connect(&server.ws_url(), None).await.unwrap();

    client.send_query("long running").await.unwrap();
    assert_eq!(recv_event(&mut client).await, Event::StartResponse);
    assert_eq!(recv_event(&mut client).await, Event::stream("first "));

    let sessions: serde_json::Value = reqwest::get(format!("{}/api/sessions", server.http_url()))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let sessions = sessions.as_array().unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["phase"], "streaming");
    let id = sessions[0]["id"].as_str().unwrap().to_string();

    let response = reqwest::Client::new()
        .delete(format!("{}/api/sessions/{id}", server.http_url()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);

    // Anything already queued may still arrive; the close must follow.
    loop {
        match tokio::time::timeout(TIMEOUT, client.recv()).await {
            Ok(Ok(Some(Decoded::Event(Event::Stream { content })))) => {
                assert_eq!(content, "second")
            }
            Ok(Ok(None)) | Ok(Err(_)) => break,
            other => panic!("unexpected frame after cancel: {other:?}"),
        }
    }
    assert!(eventually(|| server.state.sessions.is_empty()).await);
}

#[tokio::test]
async fn test_busy_query_is_rejected_in_band() {
    let server = spawn_server(test_state(stalling_script())).await;
    let mut channel = RawChannel::connect(&server).await;

    channel.send("first").await;
    assert_eq!(channel.next_event().await, Event::StartResponse);
    assert_eq!(channel.next_event().await, Event::stream("first "));
    assert_eq!(channel.next_event().await, Event::stream("second"));

    channel.send("second").await;
    match channel.next_event().await {
        Event::Error { message } => {
            assert!(message.starts_with('['), "{message}");
            assert!(message.ends_with(TURN_IN_PROGRESS), "{message}");
        }
        other => panic!("expected error, got {other:?}"),
    }

    // The first turn is still running on the same channel.
    let sessions = server.state.sessions.list();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].phase, Phase::Streaming);
}

#[tokio::test]
async fn test_client_refuses_query_during_turn() {
    let agent = stalling_script();
    let server = spawn_server(test_state(agent.clone())).await;
    let mut client = ChannelClient::connect(&server.ws_url(), None).await.unwrap();

    client.send_query("first").await.unwrap();
    assert_eq!(recv_event(&mut client).await, Event::StartResponse);

    let err = client.send_query("second").await.unwrap_err();
    assert!(matches!(err, ClientError::TurnInProgress), "{err:?}");
    assert_eq!(recv_event(&mut client).await, Event::stream("first "));
    assert_eq!(agent.started().len(), 1);
}

#[tokio::test]
async fn test_query_sent_mid_turn_leaves_first_answer_intact() {
    let agent = ScriptedLoop::new(vec![
        ScriptStep::Emit(LoopEvent::chunk("first line\n")),
        ScriptStep::Pause(Duration::from_millis(300)),
        ScriptStep::Emit(LoopEvent::chunk("second line\n")),
        ScriptStep::Emit(LoopEvent::Completed),
    ]);
    let server = spawn_server(test_state(agent.clone())).await;
    let mut channel = RawChannel::connect(&server).await;
    let mut view = TurnView::new();

    view.submit();
    channel.send("q1").await;
    assert_eq!(view.apply(channel.next_event().await), TurnUpdate::Started);
    assert_eq!(
        view.apply(channel.next_event().await),
        TurnUpdate::Content("first line\n".to_string())
    );

    view.submit();
    channel.send("q2").await;

    let mut updates = Vec::new();
    loop {
        let update = view.apply(channel.next_event().await);
        let done = matches!(update, TurnUpdate::Completed | TurnUpdate::Failed(_));
        updates.push(update);
        if done {
            break;
        }
    }

    assert!(matches!(&updates[0], TurnUpdate::Rejected(m) if m.ends_with(TURN_IN_PROGRESS)));
    assert_eq!(
        &updates[1..],
        &[
            TurnUpdate::Content("second line\n".to_string()),
            TurnUpdate::Completed,
        ]
    );
    assert_eq!(view.text(), "first line\nsecond line\n");
    assert!(view.input_enabled());
    assert_eq!(agent.started().len(), 1);
}

#[tokio::test]
async fn test_rate_limited_query_gets_one_error() {
    let agent = ScriptedLoop::from_events([LoopEvent::chunk("ok"), LoopEvent::Completed]);
    let server = spawn_server(test_state_with(agent.clone(), Admission::new(1, 1000))).await;
    let mut client = ChannelClient::connect(&server.ws_url(), None).await.unwrap();

    let outcome = client.ask("one", |_, _| {}).await.unwrap();
    assert_eq!(outcome, TurnOutcome::Completed("ok".to_string()));

    let mut updates = Vec::new();
    let outcome = client
        .ask("two", |_, update| updates.push(update.clone()))
        .await
        .unwrap();
    match outcome {
        TurnOutcome::Failed(message) => assert!(message.contains("Rate limit exceeded")),
        other => panic!("expected failure, got {other:?}"),
    }
    // No start_response precedes an admission rejection.
    assert_eq!(updates.len(), 1);
    assert_eq!(agent.started().len(), 1);
}

#[tokio::test]
async fn test_too_long_query_keeps_channel_open() {
    let agent = ScriptedLoop::from_events([LoopEvent::chunk("ok"), LoopEvent::Completed]);
    let server = spawn_server(test_state_with(agent, Admission::new(0, 10))).await;
    let mut client = ChannelClient::connect(&server.ws_url(), None).await.unwrap();

    let outcome = client.ask(&"x".repeat(11), |_, _| {}).await.unwrap();
    match outcome {
        TurnOutcome::Failed(message) => assert!(message.contains("Message too long")),
        other => panic!("expected failure, got {other:?}"),
    }

    let outcome = client.ask("short", |_, _| {}).await.unwrap();
    assert_eq!(outcome, TurnOutcome::Completed("ok".to_string()));
}

#[tokio::test]
async fn test_model_selector_reaches_agent() {
    let agent = ScriptedLoop::from_events([LoopEvent::Completed]);
    let server = spawn_server(test_state(agent.clone())).await;

    let mut client = ChannelClient::connect(&server.ws_url(), Some(OTHER_MODEL))
        .await
        .unwrap();
    client.ask("q", |_, _| {}).await.unwrap();

    let mut default = ChannelClient::connect(&server.ws_url(), None).await.unwrap();
    default.ask("q", |_, _| {}).await.unwrap();

    assert_eq!(
        agent.started(),
        vec![
            ("q".to_string(), Some(OTHER_MODEL.to_string())),
            ("q".to_string(), None),
        ]
    );
}

#[tokio::test]
async fn test_echo_provider_end_to_end() {
    let server = spawn_server(test_state(ScriptedLoop::echo(Duration::ZERO))).await;
    let mut client = ChannelClient::connect(&server.ws_url(), None).await.unwrap();

    let mut statuses = Vec::new();
    let outcome = client
        .ask("hello there", |view, update| {
            if let TurnUpdate::ToolStatus(_) = update {
                statuses.push(view.tool_status().map(str::to_string));
            }
        })
        .await
        .unwrap();

    assert_eq!(
        outcome,
        TurnOutcome::Completed("You asked: hello there".to_string())
    );
    assert_eq!(statuses, vec![Some("searching for: `hello there`".to_string())]);
}

#[tokio::test]
async fn test_closed_channel_reports_reason() {
    let server = spawn_server(test_state(stalling_script())).await;
    let mut client = ChannelClient::connect(&server.ws_url(), None).await.unwrap();

    let sessions = server.state.sessions.clone();
    let cancel = tokio::spawn(async move {
        assert!(eventually(|| sessions.list().iter().any(|s| s.phase == Phase::Streaming)).await);
        sessions.cancel_all();
    });

    let err = client.ask("q", |_, _| {}).await.unwrap_err();
    cancel.await.unwrap();
    match err {
        ClientError::Closed(Some(reason)) => assert_eq!(reason, "cancelled by server"),
        other => panic!("expected close, got {other:?}"),
    }
    recv_closed(&mut client).await;
}
