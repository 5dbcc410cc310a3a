//! Plain-text and markdown renderings of jobs and critiques.

use std::fmt::Write;

use crate::analysis::AnalysisResult;
use crate::jobs::Job;

/// One-screen status summary.
pub fn summary_text(job: &Job, advisor_name: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Job {}", job.id);
    let _ = writeln!(out, "  advisor:   {}", advisor_name);
    let _ = writeln!(
        out,
        "  mode:      {}{}",
        job.mode,
        if job.enable_retrieval { " (retrieval)" } else { "" }
    );
    let _ = writeln!(
        out,
        "  status:    {} [{}] {}%",
        job.status, job.current_step, job.progress_percentage
    );
    if job.retry_count > 0 {
        let _ = writeln!(out, "  retries:   {}", job.retry_count);
    }
    if let Some(error) = &job.error {
        let _ = writeln!(out, "  error:     {}", error);
    }
    let _ = writeln!(out, "  submitted: {}", job.created_at.to_rfc3339());
    if let Some(completed) = job.completed_at {
        let _ = writeln!(out, "  finished:  {}", completed.to_rfc3339());
    }
    if let Some(result) = &job.result {
        let _ = writeln!(
            out,
            "  overall:   {:.1}/10 ({} image, {} quote citations)",
            result.overall_score,
            result.image_citation_count(),
            result.quote_citation_count()
        );
    }
    out
}

/// Full critique as markdown.
pub fn analysis_markdown(job: &Job, result: &AnalysisResult, advisor_name: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Critique by {}", advisor_name);
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "_Job `{}`, mode `{}`. Overall score **{:.1}/10**._",
        job.id, job.mode, result.overall_score
    );
    let _ = writeln!(out);

    if !result.image_description.is_empty() {
        let _ = writeln!(out, "{}", result.image_description);
        let _ = writeln!(out);
    }

    let _ = writeln!(out, "| Dimension | Score |");
    let _ = writeln!(out, "|---|---|");
    for entry in &result.dimensions {
        let _ = writeln!(out, "| {} | {:.1} |", entry.dimension.display_name(), entry.score);
    }
    let _ = writeln!(out);

    for entry in &result.dimensions {
        let _ = writeln!(
            out,
            "## {} ({:.1})",
            entry.dimension.display_name(),
            entry.score
        );
        let _ = writeln!(out);
        if !entry.comment.is_empty() {
            let _ = writeln!(out, "{}", entry.comment);
            let _ = writeln!(out);
        }
        if !entry.recommendation.is_empty() {
            let _ = writeln!(out, "**Try:** {}", entry.recommendation);
            let _ = writeln!(out);
        }
        if let Some(citation) = &entry.citation {
            if let Some(image) = &citation.image {
                let title = image.title.as_deref().unwrap_or(&image.image_reference);
                let _ = writeln!(
                    out,
                    "- See _{}_ (scored {:.1} here)",
                    title, image.score
                );
            }
            if let Some(quote) = &citation.quote {
                let _ = match &quote.source {
                    Some(source) => writeln!(out, "> {}\n>\n> {}", quote.excerpt, source),
                    None => writeln!(out, "> {}", quote.excerpt),
                };
            }
            let _ = writeln!(out);
        }
    }

    if !result.recommendations.is_empty() {
        let _ = writeln!(out, "## Next steps");
        let _ = writeln!(out);
        for rec in &result.recommendations {
            let _ = writeln!(out, "- {}", rec);
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{AnalysisMode, Citation, DimensionScore, ImageCitation, QuoteCitation};
    use crate::dimensions::Dimension;
    use crate::jobs::JobStatus;
    use chrono::Utc;
    use std::path::PathBuf;

    fn result() -> AnalysisResult {
        AnalysisResult {
            image_description: "Dunes at dusk.".into(),
            dimensions: Dimension::ALL
                .iter()
                .map(|d| DimensionScore {
                    dimension: *d,
                    score: if *d == Dimension::Composition { 5.0 } else { 7.0 },
                    comment: "ok".into(),
                    recommendation: String::new(),
                    citation: (*d == Dimension::Composition).then(|| Citation {
                        image: Some(ImageCitation {
                            profile_id: 1,
                            image_reference: "moonrise.jpg".into(),
                            title: Some("Moonrise".into()),
                            score: 10.0,
                        }),
                        quote: Some(QuoteCitation {
                            passage_id: "p1".into(),
                            excerpt: "Simplify.".into(),
                            source: None,
                        }),
                    }),
                })
                .collect(),
            overall_score: 6.8,
            recommendations: vec!["Come back at first light".into()],
        }
    }

    fn job(result: Option<AnalysisResult>) -> Job {
        let now = Utc::now();
        Job {
            id: "job-1".into(),
            advisor_id: "adams".into(),
            mode: AnalysisMode::Rag,
            enable_retrieval: true,
            status: if result.is_some() { JobStatus::Completed } else { JobStatus::Queued },
            current_step: "done".into(),
            progress_percentage: 100,
            retry_count: 1,
            attempt: 2,
            error: None,
            image_path: PathBuf::from("/tmp/job-1.png"),
            image_sha256: "abc".into(),
            result,
            retrieved_profile_ids: Some(vec![1]),
            created_at: now,
            started_at: Some(now),
            completed_at: Some(now),
            last_activity: now,
            available_at: now,
        }
    }

    #[test]
    fn test_summary_text_mentions_state() {
        let text = summary_text(&job(Some(result())), "Ansel Adams");
        assert!(text.contains("job-1"));
        assert!(text.contains("Ansel Adams"));
        assert!(text.contains("rag (retrieval)"));
        assert!(text.contains("retries:   1"));
        assert!(text.contains("1 image, 1 quote"));
    }

    #[test]
    fn test_markdown_renders_citations() {
        let r = result();
        let md = analysis_markdown(&job(Some(r.clone())), &r, "Ansel Adams");
        assert!(md.starts_with("# Critique by Ansel Adams"));
        assert!(md.contains("## Composition (5.0)"));
        assert!(md.contains("See _Moonrise_"));
        assert!(md.contains("> Simplify."));
        assert!(md.contains("- Come back at first light"));
    }
}
