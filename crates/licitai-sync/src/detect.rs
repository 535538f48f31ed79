//! Change detection: one pure decision per incoming summary.

use chrono::{DateTime, Duration, Utc};
use licitai_core::{SummaryRecord, Tender};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReExtractReason {
    /// The listing summary changed, so the record starts a new content version.
    ContentChanged,
    /// The record was left in flight by an interrupted run and is resumed where it stopped.
    Recovery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "action", content = "reason", rename_all = "snake_case")]
pub enum Action {
    Create,
    /// Record is in flight and recently touched, most likely by a concurrent run.
    Skip,
    ReExtract(ReExtractReason),
    NoOp,
}

#[derive(Debug, Clone, Copy)]
pub struct ChangeDetector {
    stale_after: Duration,
}

impl ChangeDetector {
    pub fn new(stale_after: Duration) -> Self {
        Self { stale_after }
    }

    pub fn evaluate(
        &self,
        summary: &SummaryRecord,
        existing: Option<&Tender>,
        now: DateTime<Utc>,
    ) -> Action {
        let Some(existing) = existing else {
            return Action::Create;
        };
        if existing.raw_summary != summary.raw_summary {
            return Action::ReExtract(ReExtractReason::ContentChanged);
        }
        if existing.state.is_terminal() {
            return Action::NoOp;
        }
        if now.signed_duration_since(existing.updated_at) >= self.stale_after {
            Action::ReExtract(ReExtractReason::Recovery)
        } else {
            Action::Skip
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use licitai_core::TenderState;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).single().unwrap()
    }

    fn summary(raw: &str) -> SummaryRecord {
        SummaryRecord {
            id: "T-100".into(),
            title: "Puente".into(),
            organism: "MOP".into(),
            publish_date: None,
            close_date: None,
            raw_summary: raw.into(),
            status_code: Some(5),
        }
    }

    fn stored(state: TenderState, touched: DateTime<Utc>) -> Tender {
        let mut tender = Tender::discovered(&summary("Construcción de puente"), touched);
        tender.state = state;
        tender
    }

    #[test]
    fn unseen_summaries_are_created() {
        let detector = ChangeDetector::new(Duration::minutes(30));
        assert_eq!(detector.evaluate(&summary("x"), None, now()), Action::Create);
    }

    #[test]
    fn changed_summary_reextracts_from_any_state() {
        let detector = ChangeDetector::new(Duration::minutes(30));
        let changed = summary("Construcción de puente peatonal");
        for state in TenderState::ALL {
            let existing = stored(state, now());
            assert_eq!(
                detector.evaluate(&changed, Some(&existing), now()),
                Action::ReExtract(ReExtractReason::ContentChanged),
                "{state}"
            );
        }
    }

    #[test]
    fn title_only_corrections_are_noops_for_terminal_records() {
        let detector = ChangeDetector::new(Duration::minutes(30));
        let mut retitled = summary("Construcción de puente");
        retitled.title = "Construcción de Puente (corregido)".into();
        for state in [
            TenderState::Scored,
            TenderState::ExtractionFailed,
            TenderState::ScoringFailed,
        ] {
            let existing = stored(state, now() - Duration::days(3));
            assert_eq!(detector.evaluate(&retitled, Some(&existing), now()), Action::NoOp);
        }
    }

    #[test]
    fn in_flight_records_are_skipped_until_stale() {
        let detector = ChangeDetector::new(Duration::minutes(30));
        let same = summary("Construcción de puente");

        let fresh = stored(TenderState::Extracting, now() - Duration::minutes(5));
        assert_eq!(detector.evaluate(&same, Some(&fresh), now()), Action::Skip);

        let stuck = stored(TenderState::Extracting, now() - Duration::hours(2));
        assert_eq!(
            detector.evaluate(&same, Some(&stuck), now()),
            Action::ReExtract(ReExtractReason::Recovery)
        );
    }
}
