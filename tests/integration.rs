use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::SeedableRng;
use redpen::{
    analyze_with_feedback, export_analysis_report, export_corrected_text, score_label, Analyzer,
    Feedback, FeedbackError, FeedbackProvider, IssueSeverity, IssueType, StaticFeedback,
};

fn seeded_rng() -> StdRng {
    StdRng::seed_from_u64(7)
}

fn feedback_with_corrected(corrected: &str) -> Feedback {
    Feedback {
        corrected_text: Some(corrected.to_string()),
        ..Feedback::default()
    }
}

struct FailingProvider;

#[async_trait]
impl FeedbackProvider for FailingProvider {
    async fn fetch_feedback(&self, _text: &str) -> Result<Feedback, FeedbackError> {
        Err(FeedbackError::Unavailable("service offline".to_string()))
    }
}

#[test]
fn block_count_matches_paragraph_count() {
    let text = "First paragraph here.\n\nSecond paragraph here.\n\n\n  \nThird one.";
    let result = analyze_with_feedback(text, &Feedback::default(), &mut seeded_rng());
    assert_eq!(result.blocks.len(), 3);
    assert_eq!(result.blocks[0].id, "block-0");
    assert_eq!(result.blocks[2].id, "block-2");
    assert_eq!(result.blocks[0].text, "First paragraph here.");
    assert_eq!(result.blocks[2].text, "Third one.");
}

#[test]
fn detects_grammar_and_spelling_fixes() {
    let text = "I has a apple.";
    let feedback = feedback_with_corrected("I have an apple.");
    let result = analyze_with_feedback(text, &feedback, &mut seeded_rng());

    assert_eq!(result.blocks.len(), 1);
    let block = &result.blocks[0];
    assert_eq!(block.issues.len(), 2, "expected two issues, got {block:#?}");

    let grammar = &block.issues[0];
    assert_eq!(grammar.issue_type, IssueType::Grammar);
    assert_eq!(grammar.severity, IssueSeverity::Critical);
    assert_eq!(grammar.original, "has");
    assert_eq!(grammar.suggestion, "have");

    let spelling = &block.issues[1];
    assert_eq!(spelling.issue_type, IssueType::Spelling);
    assert_eq!(spelling.original, "a");
    assert_eq!(spelling.suggestion, "an");
}

#[test]
fn issue_offsets_match_their_substrings() {
    let text = "I has a apple.";
    let feedback = feedback_with_corrected("I have an apple.");
    let result = analyze_with_feedback(text, &feedback, &mut seeded_rng());

    for block in &result.blocks {
        for issue in &block.issues {
            assert!(
                issue.start_index < issue.end_index,
                "empty span on {}",
                issue.id
            );
            assert_eq!(
                &block.text[issue.start_index..issue.end_index],
                issue.original,
                "span of {} does not cover its original text",
                issue.id
            );
        }
    }
}

#[test]
fn minor_variants_are_never_reported() {
    let text = "The Cat sat. The dog ran.";
    let feedback = feedback_with_corrected("The cat sat. The dogs ran.");
    let result = analyze_with_feedback(text, &feedback, &mut seeded_rng());
    assert!(
        result.blocks[0].issues.is_empty(),
        "case and plural variants should be suppressed: {:#?}",
        result.blocks[0].issues
    );
}

#[test]
fn identical_corrected_block_has_no_issues() {
    let text = "Everything here is correct.";
    let feedback = feedback_with_corrected("Everything here is correct.");
    let result = analyze_with_feedback(text, &feedback, &mut seeded_rng());
    assert_eq!(result.blocks[0].corrected.as_deref(), Some(text));
    assert!(result.blocks[0].issues.is_empty());
}

#[test]
fn scores_stay_in_bounds_for_degenerate_inputs() {
    let cases: Vec<(String, Feedback)> = vec![
        (String::new(), Feedback::default()),
        ("   \n\n  ".to_string(), Feedback::default()),
        ("word".to_string(), Feedback::default()),
        ("I has a apple.".to_string(), feedback_with_corrected("I have an apple.")),
        (
            "One sentence only.".to_string(),
            Feedback {
                band_estimate: Some(9.0),
                ..feedback_with_corrected("A single sentence only.")
            },
        ),
        (
            "no punctuation at all just words going on and on".to_string(),
            Feedback {
                band_estimate: Some(1.0),
                error_analysis: Some("grammar vocabulary style unclear".to_string()),
                ..Feedback::default()
            },
        ),
    ];

    for (text, feedback) in &cases {
        let result = analyze_with_feedback(text, feedback, &mut seeded_rng());
        let m = &result.metrics;
        for (name, score) in [
            ("readability", m.readability_score),
            ("grammar", m.grammar_score),
            ("clarity", m.clarity_score),
            ("vocabulary", m.vocabulary_score),
            ("style", m.style_consistency_score),
            ("variety", m.sentence_variety_score),
            ("overall", result.overall_score),
        ] {
            assert!(
                (30..=95).contains(&score),
                "{name} score {score} out of bounds for input {text:?}"
            );
        }
    }
}

#[test]
fn band_blending_is_monotonic() {
    let text = "I has a apple.\n\nShe go to school early.";
    let mut previous = i32::MIN;
    for band in [1.0, 3.0, 5.5, 7.0, 9.0] {
        let feedback = Feedback {
            band_estimate: Some(band),
            ..feedback_with_corrected("I have an apple.\n\nShe goes to school early.")
        };
        let result = analyze_with_feedback(text, &feedback, &mut seeded_rng());
        assert!(
            result.overall_score >= previous,
            "band {band} lowered the overall score ({} -> {})",
            previous,
            result.overall_score
        );
        previous = result.overall_score;
        assert_eq!(result.metrics.ielts_estimate, Some(band));
    }
}

#[test]
fn low_overlap_rewrite_leaves_blocks_unmatched() {
    let text = "Alpha beta gamma delta.\n\nEpsilon zeta eta theta.";
    let feedback = feedback_with_corrected(
        "Completely different words one.\n\nAnother unrelated sentence two.\n\nYet more unrelated content three.",
    );
    let result = analyze_with_feedback(text, &feedback, &mut seeded_rng());
    assert_eq!(result.blocks.len(), 2);
    assert!(
        result.blocks.iter().any(|b| b.corrected.is_none()),
        "at least one block should have no confident correction"
    );
}

#[test]
fn single_paragraph_takes_entire_rewrite() {
    let text = "Short text here.";
    let feedback = feedback_with_corrected("Completely different.\n\nSecond paragraph.");
    let result = analyze_with_feedback(text, &feedback, &mut seeded_rng());
    assert_eq!(
        result.blocks[0].corrected.as_deref(),
        Some("Completely different.\n\nSecond paragraph.")
    );
}

#[test]
fn heavy_rewrite_adds_restructuring_suggestion() {
    let text = "cat sat on the mat";
    let feedback = feedback_with_corrected("car sat on the map");
    let result = analyze_with_feedback(text, &feedback, &mut seeded_rng());

    let issues = &result.blocks[0].issues;
    assert_eq!(issues.len(), 1, "expected only the whole-block suggestion");
    let issue = &issues[0];
    assert_eq!(issue.issue_type, IssueType::Clarity);
    assert_eq!(issue.severity, IssueSeverity::Suggestion);
    assert_eq!(issue.start_index, 0);
    assert_eq!(issue.end_index, text.len());
    assert_eq!(issue.original, text);
}

#[test]
fn narrative_sections_are_parsed() {
    let narrative = "## CORRECTED TEXT\nThe corrected version here.\n\n\
                     ## CRITICAL ERROR ANALYSIS\nSeveral grammar slips.\n\n\
                     ## LANGUAGE ASSESSMENT\nThe writing is clear and coherent.\n\n\
                     ## IELTS BAND SCORE ANALYSIS\nOverall Band Estimate: 6.5\n";
    let feedback = Feedback::parse(narrative);
    assert_eq!(
        feedback.corrected_text.as_deref(),
        Some("The corrected version here.")
    );
    assert_eq!(
        feedback.error_analysis.as_deref(),
        Some("Several grammar slips.")
    );
    assert_eq!(
        feedback.assessment.as_deref(),
        Some("The writing is clear and coherent.")
    );
    assert_eq!(feedback.band_estimate, Some(6.5));
    assert_eq!(feedback.full_narrative.as_deref(), Some(narrative));
}

#[test]
fn out_of_range_band_estimates_are_dropped() {
    let feedback = Feedback::parse("Overall Band Estimate: 12");
    assert_eq!(feedback.band_estimate, None);
}

#[tokio::test]
async fn narrative_only_provider_drives_full_analysis() {
    let narrative = "## CORRECTED TEXT\nI have an apple.\n\n\
                     ## CRITICAL ERROR ANALYSIS\nSubject-verb agreement and article choice.\n\n\
                     ## LANGUAGE ASSESSMENT\nThe writing is clear overall.\n\n\
                     ## IELTS BAND SCORE ANALYSIS\nOverall Band Estimate: 6.5\n";
    let provider = StaticFeedback(Feedback {
        full_narrative: Some(narrative.to_string()),
        ..Feedback::default()
    });
    let analyzer = Analyzer::new(provider).with_seed(7);

    let result = analyzer.analyze("I has a apple.").await;
    assert_eq!(result.blocks[0].issues.len(), 2);
    assert_eq!(result.metrics.ielts_estimate, Some(6.5));
    assert_eq!(result.ielts_feedback.as_deref(), Some(narrative));
    assert_eq!(result.metrics.professor_feedback, narrative);
    assert!((30..=95).contains(&result.overall_score));
}

#[tokio::test]
async fn failing_provider_still_returns_a_result() {
    let analyzer = Analyzer::new(FailingProvider);
    let result = analyzer.analyze("One paragraph here.\n\nAnother paragraph here.").await;

    assert_eq!(result.blocks.len(), 2);
    assert!(result.blocks.iter().all(|b| b.issues.is_empty()));
    assert!((30..=95).contains(&result.overall_score));
    assert_eq!(result.metrics.grammar_score, 70);
    assert_eq!(result.metrics.clarity_score, 70);
    assert_eq!(result.metrics.ielts_estimate, None);
    assert!(
        !result.metrics.professor_feedback.is_empty(),
        "degraded result should carry the fallback narrative"
    );
}

#[tokio::test]
async fn empty_input_returns_minimal_result() {
    let analyzer = Analyzer::new(StaticFeedback(Feedback::default()));
    for text in ["", "   \n\n  "] {
        let result = analyzer.analyze(text).await;
        assert!(result.blocks.is_empty());
        assert!((30..=95).contains(&result.overall_score));
    }
}

#[test]
fn error_analysis_mention_lowers_the_category_score() {
    let text = "Fine writing here.\n\nMore fine writing.";
    let corrected = feedback_with_corrected("Fine writing here.\n\nMore fine writing.");

    let plain = analyze_with_feedback(text, &corrected, &mut seeded_rng());
    let flagged = analyze_with_feedback(
        text,
        &Feedback {
            error_analysis: Some("The grammar needs sustained work.".to_string()),
            ..corrected.clone()
        },
        &mut seeded_rng(),
    );

    assert!(
        flagged.metrics.grammar_score < plain.metrics.grammar_score,
        "grammar mention should lower the grammar score ({} vs {})",
        flagged.metrics.grammar_score,
        plain.metrics.grammar_score
    );
}

#[test]
fn same_seed_produces_identical_results() {
    let text = "I has a apple.\n\nShe go to school early.";
    let feedback = Feedback {
        band_estimate: Some(6.0),
        assessment: Some("Coherent and clear writing with varied sentences.".to_string()),
        ..feedback_with_corrected("I have an apple.\n\nShe goes to school early.")
    };

    let first = analyze_with_feedback(text, &feedback, &mut seeded_rng());
    let second = analyze_with_feedback(text, &feedback, &mut seeded_rng());
    assert_eq!(
        serde_json::to_string(&first).unwrap(),
        serde_json::to_string(&second).unwrap()
    );
}

#[test]
fn sparse_text_gets_fixed_variety_score() {
    let text = "One sentence only.";
    let result = analyze_with_feedback(text, &Feedback::default(), &mut seeded_rng());
    assert_eq!(result.metrics.sentence_variety_score, 55);
}

#[test]
fn clean_text_with_identical_rewrite_scores_high() {
    let text = "The committee met on Tuesday and reviewed all three proposals in detail.\n\n\
                Implementation begins next month, and the finance team will oversee it.";
    let feedback = feedback_with_corrected(text);
    let result = analyze_with_feedback(text, &feedback, &mut seeded_rng());
    assert!(
        result.overall_score >= 90,
        "clean text should score >= 90, got {}",
        result.overall_score
    );
}

#[test]
fn json_output_is_valid() {
    let text = "I has a apple.";
    let feedback = feedback_with_corrected("I have an apple.");
    let result = analyze_with_feedback(text, &feedback, &mut seeded_rng());

    let json = serde_json::to_string_pretty(&result).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();

    assert!(parsed.get("blocks").is_some());
    assert!(parsed.get("overall_score").is_some());
    let metrics = parsed.get("metrics").unwrap();
    for key in [
        "readability_score",
        "grammar_score",
        "clarity_score",
        "vocabulary_score",
        "style_consistency_score",
        "sentence_variety_score",
        "professor_feedback",
    ] {
        assert!(metrics.get(key).is_some(), "missing metrics key {key}");
    }
    assert_eq!(
        metrics["issues_by_type"].as_object().unwrap().len(),
        6,
        "every issue type should be present"
    );
    assert_eq!(metrics["issues_by_severity"].as_object().unwrap().len(), 4);
    assert_eq!(parsed["blocks"][0]["issues"][0]["type"], "grammar");
}

#[test]
fn issue_counts_are_tallied_by_type_and_severity() {
    let text = "I has a apple.";
    let feedback = feedback_with_corrected("I have an apple.");
    let result = analyze_with_feedback(text, &feedback, &mut seeded_rng());

    let by_type = &result.metrics.issues_by_type;
    assert_eq!(by_type[&IssueType::Grammar], 1);
    assert_eq!(by_type[&IssueType::Spelling], 1);
    assert_eq!(by_type[&IssueType::Vocabulary], 0);

    let by_severity = &result.metrics.issues_by_severity;
    assert_eq!(by_severity[&IssueSeverity::Critical], 1);
    assert_eq!(by_severity[&IssueSeverity::Major], 1);
}

#[test]
fn score_labels_cover_the_range() {
    assert_eq!(score_label(95), "Excellent");
    assert_eq!(score_label(82), "Very Good");
    assert_eq!(score_label(74), "Good");
    assert_eq!(score_label(61), "Satisfactory");
    assert_eq!(score_label(52), "Needs Improvement");
    assert_eq!(score_label(45), "Poor");
    assert_eq!(score_label(30), "Critical Issues");
}

#[test]
fn corrected_text_export_falls_back_to_original() {
    let text = "Alpha beta gamma delta.\n\nEpsilon zeta eta theta.";
    let feedback = feedback_with_corrected(
        "Completely different words one.\n\nAnother unrelated sentence two.\n\nYet more unrelated content three.",
    );
    let result = analyze_with_feedback(text, &feedback, &mut seeded_rng());
    let exported = export_corrected_text(&result.blocks);
    assert!(exported.contains("Alpha beta gamma delta."));
}

#[test]
fn report_includes_scores_and_issue_details() {
    let text = "I has a apple.";
    let feedback = Feedback {
        band_estimate: Some(6.5),
        full_narrative: Some("Detailed narrative feedback.".to_string()),
        ..feedback_with_corrected("I have an apple.")
    };
    let result = analyze_with_feedback(text, &feedback, &mut seeded_rng());
    let report = export_analysis_report(&result, text);

    assert!(report.contains("# Writing Analysis Report"));
    assert!(report.contains("Quality Score:"));
    assert!(report.contains("## Metrics"));
    assert!(report.contains("### Paragraph 1"));
    assert!(report.contains("Grammatical error"));
    assert!(report.contains("Estimated IELTS Band: 6.5"));
    assert!(report.contains("## Original Text"));
}
