//! Terminal presentation: progress on stderr, faces and rankings on stdout.

use std::io::Write;

use likeness_core::registry::StatsRow;
use likeness_core::{FaceRecord, Presenter};
use serde::Serialize;

/// One ranking entry as emitted by `--json`.
#[derive(Debug, Serialize)]
pub struct RankRow<'a> {
    pub image: usize,
    pub face: usize,
    pub source: &'a str,
    pub score: f32,
}

impl<'a> RankRow<'a> {
    pub fn new(record: &'a FaceRecord, score: f32) -> Self {
        let id = record.id();
        Self {
            image: id.image,
            face: id.face,
            source: &record.detection.source_image,
            score,
        }
    }
}

pub fn face_line(face: &FaceRecord, score: Option<f32>) -> String {
    let id = face.id().to_string();
    let d = &face.detection;
    match score {
        Some(score) => format!("{id:<8} {score:>10.4}  {}", d.source_image),
        None => {
            let age = d.age.map_or_else(|| "-".to_string(), |a| format!("{a:.0}"));
            format!(
                "{id:<8} face={:.3} age={age} gender={} spaces=[{}]  {}",
                d.face_score,
                d.gender,
                face.spaces().join(","),
                d.source_image
            )
        }
    }
}

pub fn stats_table(rows: &[StatsRow]) -> String {
    let width = rows.iter().map(|r| r.name.len()).max().unwrap_or(0).max(5);
    let mut out = format!("{:<width$}  {:>6}  {:>12}\n", "model", "calls", "mean (ms)");
    for row in rows {
        let mean = row
            .mean_latency_ms
            .map_or_else(|| "-".to_string(), |ms| format!("{ms:.2}"));
        out.push_str(&format!("{:<width$}  {:>6}  {:>12}\n", row.name, row.calls, mean));
    }
    out
}

/// Writes progress to stderr. Faces are printed only while `show_faces` is set.
#[derive(Debug, Default)]
pub struct TerminalPresenter {
    pub show_faces: bool,
}

impl TerminalPresenter {
    pub fn new() -> Self {
        Self { show_faces: false }
    }
}

impl Presenter for TerminalPresenter {
    fn report_progress(&mut self, text: &str) {
        eprintln!("{text}");
    }

    fn render_face(&mut self, face: &FaceRecord, score: Option<f32>) {
        if self.show_faces {
            let mut stdout = std::io::stdout().lock();
            // A closed pipe just ends the listing.
            let _ = writeln!(stdout, "{}", face_line(face, score));
        }
    }
}
