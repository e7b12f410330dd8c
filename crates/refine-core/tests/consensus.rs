use std::sync::Arc;

use refine_core::domain::DecisionBands;
use refine_core::fakes::{verdict, ScriptedEvaluator};
use refine_core::{
    ConsensusAggregator, ConsensusMethod, EvaluationRequest, EvaluatorPanel, LessonContent,
    PanelMember, Recommendation, RefineError, Rubric, Section, ServiceError,
};

fn request() -> EvaluationRequest {
    EvaluationRequest {
        content: LessonContent {
            id: "lesson-1".to_string(),
            title: "Photosynthesis".to_string(),
            learning_objectives: vec!["Explain the light reactions".to_string()],
            sections: vec![Section::new("intro", "Intro", "Plants convert light.")],
        },
        learning_objectives: vec!["Explain the light reactions".to_string()],
        source_materials: vec![],
        rubric: Rubric::standard(),
    }
}

fn judges(
    a: &[f64],
    b: &[f64],
    c: &[f64],
) -> (Arc<ScriptedEvaluator>, Arc<ScriptedEvaluator>, Arc<ScriptedEvaluator>) {
    (
        Arc::new(ScriptedEvaluator::new("judge-a").scores(a)),
        Arc::new(ScriptedEvaluator::new("judge-b").scores(b)),
        Arc::new(ScriptedEvaluator::new("judge-c").scores(c)),
    )
}

fn fast_path(
    a: &Arc<ScriptedEvaluator>,
    b: &Arc<ScriptedEvaluator>,
    c: &Arc<ScriptedEvaluator>,
) -> ConsensusAggregator {
    let panel = EvaluatorPanel::fast_path(
        PanelMember::new(a.clone()),
        PanelMember::new(b.clone()),
        PanelMember::new(c.clone()),
    );
    ConsensusAggregator::new(panel, DecisionBands::new(0.85))
}

#[tokio::test]
async fn agreeing_primaries_skip_the_tiebreaker() {
    let (a, b, c) = judges(&[0.92], &[0.89], &[0.40]);
    let result = fast_path(&a, &b, &c).evaluate(&request()).await.unwrap();

    assert_eq!(result.method, ConsensusMethod::Unanimous);
    assert!(result.consensus_reached);
    assert_eq!(result.final_recommendation, Recommendation::Accept);
    assert!((result.final_score - 0.905).abs() < 1e-9);
    assert_eq!(result.votes.len(), 2);
    assert_eq!(c.calls(), 0);
    assert!(result.is_well_formed());
}

#[tokio::test]
async fn split_primaries_consult_the_tiebreaker() {
    let (a, b, c) = judges(&[0.95], &[0.55], &[0.90]);
    let result = fast_path(&a, &b, &c).evaluate(&request()).await.unwrap();

    assert_eq!(c.calls(), 1);
    assert_eq!(result.method, ConsensusMethod::Tiebreaker);
    assert!(result.consensus_reached);
    assert_eq!(result.final_recommendation, Recommendation::Accept);
    assert_eq!(result.votes.len(), 3);
    assert_eq!(result.votes[2].evaluator_id, "judge-c");
    assert!(result.is_well_formed());
}

#[tokio::test]
async fn tiebreaker_matching_nobody_decides_alone() {
    let (a, b, c) = judges(&[0.95], &[0.40], &[0.70]);
    let result = fast_path(&a, &b, &c).evaluate(&request()).await.unwrap();

    assert_eq!(result.method, ConsensusMethod::Tiebreaker);
    assert!(!result.consensus_reached);
    assert_eq!(result.final_recommendation, Recommendation::Revise);
}

#[tokio::test]
async fn same_verdicts_give_same_consensus() {
    let (a, b, c) = judges(&[0.95], &[0.55], &[0.90]);
    let aggregator = fast_path(&a, &b, &c);
    let first = aggregator.evaluate(&request()).await.unwrap();
    let second = aggregator.evaluate(&request()).await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn full_panel_majority() {
    let (a, b, c) = judges(&[0.90], &[0.88], &[0.50]);
    let panel = EvaluatorPanel::full_panel(
        PanelMember::new(a.clone()),
        PanelMember::new(b.clone()),
        PanelMember::new(c.clone()),
    );
    let result = ConsensusAggregator::new(panel, DecisionBands::new(0.85))
        .evaluate(&request())
        .await
        .unwrap();

    assert_eq!(c.calls(), 1);
    assert_eq!(result.method, ConsensusMethod::Majority);
    assert_eq!(result.final_recommendation, Recommendation::Accept);
}

#[tokio::test]
async fn weights_shift_the_final_score() {
    let a = Arc::new(ScriptedEvaluator::new("judge-a").scores(&[0.90]));
    let b = Arc::new(ScriptedEvaluator::new("judge-b").scores(&[0.86]));
    let c = Arc::new(ScriptedEvaluator::new("judge-c"));
    let panel = EvaluatorPanel::fast_path(
        PanelMember::weighted(a, 3.0),
        PanelMember::weighted(b, 1.0),
        PanelMember::new(c),
    );
    let result = ConsensusAggregator::new(panel, DecisionBands::new(0.85))
        .evaluate(&request())
        .await
        .unwrap();
    assert!((result.final_score - 0.89).abs() < 1e-9);
}

#[tokio::test]
async fn unreachable_judge_is_reported() {
    let a = Arc::new(ScriptedEvaluator::new("judge-a").scores(&[0.9]));
    let b = Arc::new(
        ScriptedEvaluator::new("judge-b")
            .then_fail(ServiceError::Unavailable("connection refused".to_string())),
    );
    let c = Arc::new(ScriptedEvaluator::new("judge-c").scores(&[0.9]));
    let err = fast_path(&a, &b, &c).evaluate(&request()).await.unwrap_err();

    match err {
        RefineError::EvaluatorUnavailable { evaluator, reason } => {
            assert_eq!(evaluator, "judge-b");
            assert!(reason.contains("connection refused"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn out_of_range_score_is_rejected() {
    let mut bad = verdict(0.9);
    bad.overall_score = 1.4;
    let a = Arc::new(ScriptedEvaluator::new("judge-a").then(bad));
    let b = Arc::new(ScriptedEvaluator::new("judge-b").scores(&[0.9]));
    let c = Arc::new(ScriptedEvaluator::new("judge-c").scores(&[0.9]));
    let err = fast_path(&a, &b, &c).evaluate(&request()).await.unwrap_err();
    assert!(matches!(err, RefineError::EvaluatorUnavailable { .. }));
}

#[test]
fn panel_rejects_non_positive_weight() {
    let judge = Arc::new(ScriptedEvaluator::new("judge-a"));
    let panel = EvaluatorPanel::fast_path(
        PanelMember::weighted(judge.clone(), 0.0),
        PanelMember::new(judge.clone()),
        PanelMember::new(judge),
    );
    assert!(panel.validate().is_err());
}
