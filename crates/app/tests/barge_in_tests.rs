//! Barge-in and interruption: spoken-prefix commits and client-initiated
//! cancellation.

mod common;

use common::*;

use voxloop_app::transport::control::ControlMessage;
use voxloop_foundation::EngineConfig;
use voxloop_llm::ScriptedLlm;
use voxloop_stt::ScriptedStt;

const LONG_REPLY: &str = "Certainly, let me explain in detail. \
First comes the opening point which takes a while to say out loud. \
Second comes another point of a similar length to keep the stream going. \
Third is one more stretch of words so the reply lasts long enough. \
Fourth and finally the closing point which nobody will ever hear.";

#[tokio::test]
async fn barge_in_commits_only_the_spoken_prefix() {
    let stt = ScriptedStt::new()
        .with_transcript("tell me everything")
        .with_transcript("actually stop");
    // Slow token deltas keep the reply streaming for a couple of seconds,
    // so the barge-in lands mid-generation.
    let (llm, calls) = RecordingLlm::new(
        ScriptedLlm::new()
            .with_rule("tell me everything", LONG_REPLY)
            .with_rule("actually stop", "Okay.")
            .with_delta_chars(4)
            .with_delta_delay(std::time::Duration::from_millis(30)),
    );
    let mut client = start_session(EngineConfig::default(), providers(stt, llm)).await;

    speak_turn(&mut client, 1200).await;

    // Wait until at least one utterance has fully played out, so the
    // committed prefix is provably non-empty, then talk over the bot.
    loop {
        match client.next_event().await {
            ClientEvent::Control(ControlMessage::TtsStopped { turn_id }) if turn_id == 1 => break,
            ClientEvent::Audio(_) | ClientEvent::Control(_) => continue,
            other => panic!("unexpected event {other:?}"),
        }
    }
    speak_turn(&mut client, 600).await;

    // Drain whatever was in flight; the second turn's reply follows.
    let mut saw_second_reply = false;
    for _ in 0..500 {
        match client.next_event().await {
            ClientEvent::Control(ControlMessage::TtsStopped { turn_id }) if turn_id == 2 => {
                saw_second_reply = true;
                break;
            }
            ClientEvent::Closed => panic!("session closed early"),
            _ => {}
        }
    }
    assert!(saw_second_reply, "interrupting speech must start a new turn");

    let calls = calls.lock().unwrap();
    assert_eq!(calls.len(), 2);
    let second_prompt = &calls[1];
    // The committed assistant text is a strict, non-empty prefix of the
    // full reply: exactly what had been spoken when the user barged in.
    let committed = &second_prompt[2];
    assert_eq!(committed.role, voxloop_frames::Role::Assistant);
    assert!(!committed.text.is_empty(), "nothing was committed");
    assert!(
        LONG_REPLY.starts_with(&committed.text),
        "committed text is not a prefix: {:?}",
        committed.text
    );
    assert!(
        committed.text.len() < LONG_REPLY.len(),
        "the whole reply was committed despite the interruption"
    );

    drop(calls);
    client.close().await.unwrap();
}

#[tokio::test]
async fn client_interrupt_during_thinking_commits_nothing() {
    let stt = ScriptedStt::new()
        .with_transcript("slow question")
        .with_transcript("fast question");
    // Slow deltas leave the turn in THINKING long enough to interrupt.
    let (llm, calls) = RecordingLlm::new(
        ScriptedLlm::new()
            .with_rule("slow question", "A reply that never finishes streaming out.")
            .with_rule("fast question", "Quick.")
            .with_delta_chars(2)
            .with_delta_delay(std::time::Duration::from_millis(50)),
    );
    let mut client = start_session(EngineConfig::default(), providers(stt, llm)).await;

    speak_turn(&mut client, 1000).await;
    // Let the prompt reach the model, then cancel from the control plane.
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    client
        .send_control(&ControlMessage::Interrupt { reason: None })
        .await;

    // Second turn proceeds normally.
    speak_turn(&mut client, 1000).await;
    let reply = client.collect_bot_reply().await;
    assert!(reply.stopped_turns.contains(&2));

    let calls = calls.lock().unwrap();
    let second_prompt = calls.last().unwrap();
    // No trace of turn 1 in the context: system + user only.
    assert_eq!(
        second_prompt.len(),
        2,
        "interrupted THINKING turn leaked into context: {second_prompt:?}"
    );

    drop(calls);
    client.close().await.unwrap();
}
