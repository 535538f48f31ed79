use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use licitai_adapters::{ConnectorConfig, FixtureSource, PageCursor, SourceConnector, SyncWindow};

fn fixtures_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/mercado-publico")
}

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 3, d).unwrap()
}

#[tokio::test]
async fn fixture_window_walks_pages_and_skips_malformed_day() {
    let connector = SourceConnector::new(
        Arc::new(FixtureSource::new(fixtures_root())),
        ConnectorConfig::default(),
    );
    let mut pages = connector.poll(&SyncWindow::new(day(2), day(3)));

    let mut ids = Vec::new();
    let mut cursors = Vec::new();
    while let Some(page) = pages.next_page().await.unwrap() {
        cursors.push(page.cursor);
        ids.extend(page.items.iter().map(|s| s.id.clone()));
        pages.confirm(&page);
    }

    assert_eq!(ids, vec!["1057-12-LE26", "2231-4-L126", "4410-7-LP26"]);
    assert_eq!(
        cursors,
        vec![
            PageCursor::start_of(day(2)),
            PageCursor::start_of(day(2)).next_page(),
            PageCursor::start_of(day(3)).next_page(),
        ]
    );
    assert_eq!(pages.skipped_pages(), &[PageCursor::start_of(day(3))]);
    assert_eq!(pages.cursor(), None);
}

#[tokio::test]
async fn resumed_window_starts_at_saved_cursor() {
    let connector = SourceConnector::new(
        Arc::new(FixtureSource::new(fixtures_root())),
        ConnectorConfig::default(),
    );
    let resume = PageCursor::start_of(day(2)).next_page();
    let mut pages = connector.poll(&SyncWindow::new(day(2), day(2)).resuming(Some(resume)));

    let page = pages.next_page().await.unwrap().expect("page");
    assert_eq!(page.cursor, resume);
    assert_eq!(page.items[0].organism, "Dirección de Vialidad Región de Los Ríos");
}
