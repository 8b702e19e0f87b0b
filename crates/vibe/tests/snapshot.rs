//! Binary snapshot round-trips of suspended runs, and the resume
//! idempotence law.

mod common;

use common::{e, model_decl};
use pretty_assertions::assert_eq;
use vibe::{
    AiOpKind, Expr, NoopTracer, NoPrint, Payload, Program, RunOptions, RunState, Status, Stmt, ValueSource,
    WrappedValue, run_until_pause,
};

fn suspended_at_ai() -> RunState {
    let program = Program::new("main.vibe").with_statements(vec![
        model_decl(),
        Stmt::let_untyped(
            "r",
            e(Expr::ai(AiOpKind::Do, e(Expr::text("question")), e(Expr::var("m")))),
        ),
    ]);
    let mut state = RunState::create_initial_state(&program, RunOptions::default());
    run_until_pause(&mut state, &mut NoPrint, &mut NoopTracer);
    assert_eq!(state.status, Status::AwaitingAi);
    state
}

#[test]
fn suspended_state_round_trips_through_binary() {
    let state = suspended_at_ai();
    let bytes = state.dump().unwrap();
    let restored = RunState::load(&bytes).unwrap();
    assert_eq!(restored, state);
}

#[test]
fn restored_state_resumes_to_completion() {
    let state = suspended_at_ai();
    let bytes = state.dump().unwrap();
    let restored = RunState::load(&bytes).unwrap();

    let answer = WrappedValue::wrap(Payload::Text("resumed".to_owned()), ValueSource::Ai);
    let mut state = restored.resume_with_ai_response(answer);
    assert_eq!(state.status, Status::Running);
    run_until_pause(&mut state, &mut NoPrint, &mut NoopTracer);

    assert_eq!(state.status, Status::Completed);
    assert_eq!(
        *state.lookup("r").unwrap().payload(),
        Payload::Text("resumed".to_owned())
    );
}

#[test]
fn resume_without_matching_pending_is_a_noop() {
    // Idempotence: a resume against a state that is not awaiting that
    // operation leaves it untouched, and another burst makes no progress.
    let mut state = suspended_at_ai();
    let before = state.clone();

    // Wrong resume kind: nothing happens.
    state = state.resume_with_tool_result(WrappedValue::null());
    assert_eq!(state, before);

    // Matching resume, then a second identical resume is absorbed.
    state = state.resume_with_ai_response(WrappedValue::wrap(
        Payload::Text("x".to_owned()),
        ValueSource::Ai,
    ));
    let after_first = state.clone();
    state = state.resume_with_ai_response(WrappedValue::wrap(
        Payload::Text("y".to_owned()),
        ValueSource::Ai,
    ));
    assert_eq!(state, after_first);
}

#[test]
fn completed_state_snapshot_preserves_interactions_log() {
    let mut state = suspended_at_ai();
    state.ai_interactions.push(vibe::AiInteraction {
        id: "do-000001".to_owned(),
        operation: vibe::OperationKind::Do,
        model: "mock".to_owned(),
        rounds: 1,
        retries: 0,
        usage: vibe::TokenUsage::default(),
        duration_ms: 12,
        error: None,
    });
    let restored = RunState::load(&state.dump().unwrap()).unwrap();
    assert_eq!(restored.ai_interactions.len(), 1);
    assert_eq!(restored.ai_interactions[0].id, "do-000001");
}
