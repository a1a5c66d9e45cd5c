//! Streaming top-volume tracker over the aggregate all-tickers stream.
//!
//! Consumes the exchange's `!ticker@arr` stream, maintains symbol → latest
//! ticker, and on a fixed cadence re-ranks the tracked USDT perpetuals by
//! 24h quote volume, emitting dark-horse events for symbols that storm the
//! board. Reconnects with a fixed short back-off while the lifecycle token
//! is alive.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::types::market_data::flex;
use crate::types::Ticker;

/// Delay between reconnect attempts.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
/// Rank climb that qualifies as a dark horse on its own.
const RANK_JUMP_THRESHOLD: usize = 10;
/// Assumed origin rank for symbols entering from outside the board.
const OFF_BOARD_RANK: usize = 100;

/// A symbol newly entering or sharply climbing the volume ranking.
#[derive(Debug, Clone)]
pub struct DarkHorseEvent {
    pub symbol: String,
    /// 1-based rank in the fresh ranking.
    pub current_rank: usize,
    /// 1-based rank in the previous ranking; `None` if it was off the board.
    pub previous_rank: Option<usize>,
    pub rank_jump: usize,
    pub volume_24h: f64,
    pub price_change_pct: f64,
    /// 1–3.
    pub confidence: u8,
    pub detected_at: DateTime<Utc>,
}

struct TrackerState {
    tickers: HashMap<String, Ticker>,
    top_symbols: Vec<String>,
    /// symbol → 1-based rank of the previously committed ranking.
    previous_ranks: HashMap<String, usize>,
}

pub struct TickerTracker {
    ws_url: String,
    top_n: usize,
    rank_interval: Duration,
    exclude: Vec<String>,
    state: RwLock<TrackerState>,
    events: mpsc::Sender<DarkHorseEvent>,
    shutdown: CancellationToken,
    messages_received: AtomicU64,
    errors: AtomicU64,
}

impl TickerTracker {
    pub fn new(
        ws_url: String,
        top_n: usize,
        rank_interval_seconds: u64,
        exclude: Vec<String>,
        events: mpsc::Sender<DarkHorseEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            ws_url,
            top_n,
            rank_interval: Duration::from_secs(rank_interval_seconds.max(1)),
            exclude,
            state: RwLock::new(TrackerState {
                tickers: HashMap::new(),
                top_symbols: Vec::new(),
                previous_ranks: HashMap::new(),
            }),
            events,
            shutdown,
            messages_received: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    /// Run the consumer and the periodic re-ranker until cancellation.
    pub async fn run(self: Arc<Self>) {
        let ranker = {
            let tracker = self.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(tracker.rank_interval);
                interval.tick().await; // immediate first tick
                loop {
                    tokio::select! {
                        _ = tracker.shutdown.cancelled() => break,
                        _ = interval.tick() => tracker.recompute_ranking().await,
                    }
                }
            })
        };

        while !self.shutdown.is_cancelled() {
            match self.connect_and_consume().await {
                Ok(()) => break, // clean shutdown
                Err(e) => {
                    self.errors.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "ticker stream disconnected, retrying in 5s");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                    }
                }
            }
        }

        ranker.abort();
        info!(
            messages = self.messages_received.load(Ordering::Relaxed),
            errors = self.errors.load(Ordering::Relaxed),
            "ticker tracker stopped"
        );
    }

    async fn connect_and_consume(&self) -> Result<(), crate::errors::EngineError> {
        info!(url = %self.ws_url, "connecting ticker stream");
        let (ws_stream, _response) = connect_async(&self.ws_url).await?;
        info!("ticker stream connected");

        let (mut write, mut read) = ws_stream.split();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.messages_received.fetch_add(1, Ordering::Relaxed);
                            self.handle_message(&text).await;
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            if let Err(e) = write.send(Message::Pong(payload)).await {
                                warn!(error = %e, "failed to answer ping");
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            debug!(?frame, "ticker stream close frame");
                            return Err(crate::errors::EngineError::DataUnavailable {
                                name: "ticker stream closed".into(),
                            });
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                        None => {
                            return Err(crate::errors::EngineError::DataUnavailable {
                                name: "ticker stream ended".into(),
                            })
                        }
                    }
                }
            }
        }
    }

    /// Upsert tickers from one stream frame. The write lock is held only for
    /// the map update.
    async fn handle_message(&self, text: &str) {
        let Ok(frame) = serde_json::from_str::<StreamFrame>(text) else {
            return; // silently skip undecodable frames
        };
        if frame.data.is_empty() {
            return;
        }

        let mut state = self.state.write().await;
        for raw in frame.data {
            if !is_usdt_perp(&raw.symbol) || self.exclude.iter().any(|s| s == &raw.symbol) {
                continue;
            }
            state.tickers.insert(
                raw.symbol.clone(),
                Ticker {
                    symbol: raw.symbol,
                    last_price: raw.last_price,
                    quote_volume: raw.quote_volume,
                    price_change_pct: raw.price_change_pct,
                    event_time: raw.event_time,
                },
            );
        }
    }

    /// Re-rank by quote volume, diff against the previous committed ranking,
    /// emit dark-horse events, and commit. Runs only from the single ranker
    /// task; the write lock gives readers a consistent snapshot.
    async fn recompute_ranking(&self) {
        let mut state = self.state.write().await;
        if state.tickers.is_empty() {
            return;
        }

        let mut ranked: Vec<(String, f64, f64)> = state
            .tickers
            .values()
            .map(|t| (t.symbol.clone(), t.quote_volume, t.price_change_pct))
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        ranked.truncate(self.top_n);

        let events = if state.previous_ranks.is_empty() {
            Vec::new() // first ranking: nothing to diff against
        } else {
            diff_rankings(&state.previous_ranks, &ranked)
        };

        state.top_symbols = ranked.iter().map(|(s, _, _)| s.clone()).collect();
        state.previous_ranks = ranked
            .iter()
            .enumerate()
            .map(|(i, (s, _, _))| (s.clone(), i + 1))
            .collect();
        let tracked = state.tickers.len();
        drop(state);

        debug!(top = self.top_n, tracked, "volume ranking recomputed");

        for event in events {
            info!(
                symbol = %event.symbol,
                current_rank = event.current_rank,
                previous_rank = ?event.previous_rank,
                rank_jump = event.rank_jump,
                confidence = event.confidence,
                "dark horse detected"
            );
            if self.events.try_send(event).is_err() {
                warn!("dark horse channel full, dropping event");
            }
        }
    }

    /// Current top-N symbols, best first.
    pub async fn top_symbols(&self) -> Vec<String> {
        self.state.read().await.top_symbols.clone()
    }

    pub async fn ticker(&self, symbol: &str) -> Option<Ticker> {
        self.state.read().await.tickers.get(symbol).cloned()
    }

    pub async fn ticker_count(&self) -> usize {
        self.state.read().await.tickers.len()
    }
}

/// Diff a fresh ranking against the previous one and surface dark horses.
///
/// `ranked` is (symbol, quote volume, price change %) ordered best first.
pub(crate) fn diff_rankings(
    previous: &HashMap<String, usize>,
    ranked: &[(String, f64, f64)],
) -> Vec<DarkHorseEvent> {
    let mut events = Vec::new();

    for (index, (symbol, volume, price_change_pct)) in ranked.iter().enumerate() {
        let current_rank = index + 1;
        let previous_rank = previous.get(symbol).copied();

        let qualifies = match previous_rank {
            None => true,
            Some(prev) => prev >= current_rank + RANK_JUMP_THRESHOLD,
        };
        if !qualifies {
            continue;
        }

        let rank_jump = match previous_rank {
            None => OFF_BOARD_RANK.saturating_sub(current_rank),
            Some(prev) => prev - current_rank,
        };

        events.push(DarkHorseEvent {
            symbol: symbol.clone(),
            current_rank,
            previous_rank,
            rank_jump,
            volume_24h: *volume,
            price_change_pct: *price_change_pct,
            confidence: dark_horse_confidence(current_rank, previous_rank, rank_jump),
            detected_at: Utc::now(),
        });
    }

    events
}

/// Confidence from the magnitude of the move and the destination rank.
pub(crate) fn dark_horse_confidence(
    current_rank: usize,
    previous_rank: Option<usize>,
    rank_jump: usize,
) -> u8 {
    match previous_rank {
        None if current_rank <= 20 => 3,
        None if current_rank <= 30 => 2,
        None => 1,
        Some(_) if rank_jump >= 20 => 3,
        Some(_) if rank_jump >= RANK_JUMP_THRESHOLD => 2,
        Some(_) => 1,
    }
}

fn is_usdt_perp(symbol: &str) -> bool {
    symbol.len() > 4 && symbol.ends_with("USDT")
}

// ---------------------------------------------------------------------------
// Stream frame types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct StreamFrame {
    #[allow(dead_code)]
    stream: String,
    data: Vec<RawTicker>,
}

#[derive(Debug, Deserialize)]
struct RawTicker {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "c", deserialize_with = "flex::f64")]
    last_price: f64,
    #[serde(rename = "q", deserialize_with = "flex::f64")]
    quote_volume: f64,
    #[serde(rename = "P", deserialize_with = "flex::f64")]
    price_change_pct: f64,
    #[serde(rename = "E", default)]
    event_time: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranking_of(symbols: &[&str]) -> Vec<(String, f64, f64)> {
        symbols
            .iter()
            .enumerate()
            .map(|(i, s)| (s.to_string(), 1_000_000.0 - i as f64 * 1_000.0, 1.0))
            .collect()
    }

    fn ranks_of(symbols: &[&str]) -> HashMap<String, usize> {
        symbols
            .iter()
            .enumerate()
            .map(|(i, s)| (s.to_string(), i + 1))
            .collect()
    }

    #[test]
    fn rank_jump_emits_event_with_confidence_3() {
        // X sits at rank 47, then climbs to rank 20.
        let mut previous_symbols: Vec<String> =
            (1..=50).map(|i| format!("COIN{i}USDT")).collect();
        previous_symbols[46] = "XUSDT".into();
        let previous = ranks_of(&previous_symbols.iter().map(|s| s.as_str()).collect::<Vec<_>>());

        let mut new_symbols = previous_symbols.clone();
        new_symbols.remove(46);
        new_symbols.insert(19, "XUSDT".into());
        let ranked = ranking_of(&new_symbols.iter().map(|s| s.as_str()).collect::<Vec<_>>());

        let events = diff_rankings(&previous, &ranked);
        let x = events.iter().find(|e| e.symbol == "XUSDT").expect("event for X");
        assert_eq!(x.current_rank, 20);
        assert_eq!(x.previous_rank, Some(47));
        assert_eq!(x.rank_jump, 27);
        assert_eq!(x.confidence, 3);
    }

    #[test]
    fn new_entry_top_20_is_confidence_3() {
        let previous = ranks_of(&["AUSDT", "BUSDT", "CUSDT"]);
        let mut symbols: Vec<&str> = vec!["AUSDT", "BUSDT", "CUSDT"];
        // Insert an unseen symbol at rank 18 — pad the list first.
        let padded: Vec<String> = (0..30)
            .map(|i| {
                if i == 17 {
                    "NEWUSDT".to_string()
                } else if i < 3 {
                    symbols[i].to_string()
                } else {
                    format!("PAD{i}USDT")
                }
            })
            .collect();
        symbols = padded.iter().map(|s| s.as_str()).collect();
        let ranked = ranking_of(&symbols);

        let events = diff_rankings(&previous, &ranked);
        let entry = events.iter().find(|e| e.symbol == "NEWUSDT").unwrap();
        assert_eq!(entry.current_rank, 18);
        assert_eq!(entry.previous_rank, None);
        assert_eq!(entry.rank_jump, 82);
        assert_eq!(entry.confidence, 3);
    }

    #[test]
    fn small_moves_do_not_fire() {
        let previous = ranks_of(&["AUSDT", "BUSDT", "CUSDT", "DUSDT"]);
        // B climbs one spot: below the jump threshold.
        let ranked = ranking_of(&["BUSDT", "AUSDT", "CUSDT", "DUSDT"]);
        assert!(diff_rankings(&previous, &ranked).is_empty());
    }

    #[test]
    fn confidence_ladder() {
        assert_eq!(dark_horse_confidence(18, None, 82), 3);
        assert_eq!(dark_horse_confidence(25, None, 75), 2);
        assert_eq!(dark_horse_confidence(45, None, 55), 1);
        assert_eq!(dark_horse_confidence(10, Some(35), 25), 3);
        assert_eq!(dark_horse_confidence(30, Some(42), 12), 2);
    }

    #[test]
    fn usdt_perp_filter() {
        assert!(is_usdt_perp("SOLUSDT"));
        assert!(!is_usdt_perp("USDT"));
        assert!(!is_usdt_perp("SOLBTC"));
    }

    #[test]
    fn stream_frame_decodes_mixed_numerics() {
        let text = r#"{"stream":"!ticker@arr","data":[
            {"s":"SOLUSDT","c":"172.4","q":"91000000.5","P":"4.2","E":1700000000000},
            {"s":"OPUSDT","c":2.31,"q":45000000,"P":-1.5,"E":1700000000001}
        ]}"#;
        let frame: StreamFrame = serde_json::from_str(text).unwrap();
        assert_eq!(frame.data.len(), 2);
        assert_eq!(frame.data[0].last_price, 172.4);
        assert_eq!(frame.data[1].quote_volume, 45_000_000.0);
    }
}
