use std::sync::Arc;

use refine_core::fakes::{ScriptedEvaluator, ScriptedGenerator, ScriptedVerifier};
use refine_core::{
    read_report_artifact, write_report_artifact, EvaluatorPanel, LessonContent, PanelMember,
    RefineError, RefinementConfig, RefinementEngine, RefinementMode, RefinementReport,
    RefinementRequest, Section,
};
use tempfile::tempdir;

async fn finished_run() -> RefinementReport {
    let panel = EvaluatorPanel::fast_path(
        PanelMember::new(Arc::new(ScriptedEvaluator::new("judge-a").scores(&[0.9]))),
        PanelMember::new(Arc::new(ScriptedEvaluator::new("judge-b").scores(&[0.9]))),
        PanelMember::new(Arc::new(ScriptedEvaluator::new("judge-c").scores(&[0.9]))),
    );
    let engine = RefinementEngine::new(
        RefinementConfig::for_mode(RefinementMode::SemiAuto),
        panel,
        Arc::new(ScriptedGenerator::rewriting(100)),
        Arc::new(ScriptedVerifier::approving(0.9)),
    )
    .unwrap();
    let lesson = LessonContent {
        id: "lesson-1".to_string(),
        title: "Fractions".to_string(),
        learning_objectives: vec![],
        sections: vec![Section::new("intro", "Intro", "A fraction is a part of a whole.")],
    };
    engine.run(RefinementRequest::new(lesson)).await.unwrap()
}

#[tokio::test]
async fn report_round_trips_through_disk() {
    let report = finished_run().await;
    let dir = tempdir().unwrap();

    let path = write_report_artifact(&report, dir.path()).unwrap();
    assert!(path.ends_with("refinement.json"));
    assert!(dir.path().join(&report.run_id).join("refinement.digest").exists());

    let artifact = read_report_artifact(&report.run_id, dir.path()).unwrap();
    assert_eq!(artifact.report, report);
    assert_eq!(artifact.report_digest.len(), 64);
}

#[tokio::test]
async fn tampered_digest_is_rejected() {
    let report = finished_run().await;
    let dir = tempdir().unwrap();
    write_report_artifact(&report, dir.path()).unwrap();

    std::fs::write(
        dir.path().join(&report.run_id).join("refinement.digest"),
        "0".repeat(64),
    )
    .unwrap();

    let err = read_report_artifact(&report.run_id, dir.path()).unwrap_err();
    assert!(matches!(err, RefineError::DigestMismatch { .. }));
}

#[tokio::test]
async fn averaged_scores_survive_the_round_trip() {
    let mut report = finished_run().await;
    // Means of three judges rarely have a short decimal form.
    report.score_history = (1..=200)
        .map(|i| {
            let i = i as f64;
            (i / 397.0 + i / 401.0 + 0.1 + i / 409.0) / 3.0
        })
        .collect();
    let dir = tempdir().unwrap();
    write_report_artifact(&report, dir.path()).unwrap();

    let artifact = read_report_artifact(&report.run_id, dir.path()).unwrap();
    assert_eq!(artifact.report.score_history, report.score_history);
    assert_eq!(artifact.report, report);
}

#[tokio::test]
async fn edited_report_body_is_rejected() {
    let report = finished_run().await;
    let dir = tempdir().unwrap();
    let path = write_report_artifact(&report, dir.path()).unwrap();

    let body = std::fs::read_to_string(&path).unwrap();
    std::fs::write(&path, body.replacen("Fractions", "Decimals", 1)).unwrap();

    let err = read_report_artifact(&report.run_id, dir.path()).unwrap_err();
    assert!(matches!(err, RefineError::DigestMismatch { .. }));
}

#[tokio::test]
async fn missing_artifact_is_an_io_error() {
    let dir = tempdir().unwrap();
    let err = read_report_artifact("refine-missing", dir.path()).unwrap_err();
    assert!(matches!(err, RefineError::Io(_)));
}
