// =============================================================================
// Market feed — resilient WebSocket tick ingest
// =============================================================================
//
// Connects to the broker's live market feed, subscribes the requested
// instruments, and folds every ticker/quote frame into the tick cache. The
// outer loop reconnects with exponential backoff and replays the full
// subscription list after every reconnect, so the core only ever observes a
// feed gap through tick age.
//
// Wire format: each binary frame starts with an 8-byte response header
//   [0]     feed response code (2 = ticker, 4 = quote, 50 = disconnect)
//   [1..3]  message length, u16 LE
//   [3]     exchange segment code
//   [4..8]  security id, u32 LE
// followed by the packet body. Prices are f32 LE; the exchange timestamp is
// epoch seconds.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::money::Money;
use crate::ticks::TickCache;
use crate::types::{SecurityId, Segment, Tick};

const FEED_URL: &str = "wss://api-feed.dhan.co";

/// Response codes we act on.
const CODE_TICKER: u8 = 2;
const CODE_QUOTE: u8 = 4;
const CODE_DISCONNECT: u8 = 50;

/// Subscription request code for ticker+quote packets.
const SUBSCRIBE_REQUEST_CODE: u8 = 15;

/// Reconnect backoff ladder, capped.
const BACKOFF_START: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// One instrument to subscribe.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FeedInstrument {
    pub segment: Segment,
    pub security_id: SecurityId,
}

/// Handle for adding subscriptions after the feed task has started (new
/// option legs are subscribed as positions open).
#[derive(Debug, Clone)]
pub struct FeedHandle {
    tx: mpsc::UnboundedSender<Vec<FeedInstrument>>,
}

impl FeedHandle {
    pub fn subscribe(&self, instruments: Vec<FeedInstrument>) {
        if self.tx.send(instruments).is_err() {
            warn!("feed task is gone — subscription dropped");
        }
    }
}

/// Spawn the feed task. Returns the subscription handle; the task runs until
/// the runtime shuts down.
pub fn spawn_feed(
    client_id: String,
    access_token: String,
    initial: Vec<FeedInstrument>,
    ticks: Arc<TickCache>,
) -> FeedHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run_feed(client_id, access_token, initial, rx, ticks));
    FeedHandle { tx }
}

async fn run_feed(
    client_id: String,
    access_token: String,
    initial: Vec<FeedInstrument>,
    mut additions: mpsc::UnboundedReceiver<Vec<FeedInstrument>>,
    ticks: Arc<TickCache>,
) {
    let mut subscribed: HashSet<FeedInstrument> = initial.into_iter().collect();
    let mut backoff = BACKOFF_START;

    loop {
        let url = format!(
            "{FEED_URL}?version=2&token={access_token}&clientId={client_id}&authType=2"
        );

        match connect_async(&url).await {
            Ok((ws, _response)) => {
                info!(instruments = subscribed.len(), "market feed connected");
                backoff = BACKOFF_START;

                let (mut write, mut read) = ws.split();

                // Resubscribe everything accumulated so far.
                let list: Vec<FeedInstrument> = subscribed.iter().cloned().collect();
                if let Err(e) = send_subscription(&mut write, &list).await {
                    error!(error = %e, "subscription send failed — reconnecting");
                    tokio::time::sleep(backoff).await;
                    continue;
                }

                loop {
                    tokio::select! {
                        frame = read.next() => match frame {
                            Some(Ok(Message::Binary(payload))) => {
                                match parse_frame(&payload) {
                                    ParsedFrame::Tick(tick) => {
                                        debug!(
                                            security_id = %tick.security_id,
                                            ltp = %tick.ltp,
                                            "tick"
                                        );
                                        ticks.put(tick);
                                    }
                                    ParsedFrame::Disconnect => {
                                        warn!("feed sent disconnect packet");
                                        break;
                                    }
                                    ParsedFrame::Ignored => {}
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                warn!("market feed stream closed");
                                break;
                            }
                            Some(Ok(_)) => {
                                // Text/ping/pong frames carry nothing we need;
                                // tungstenite answers pings itself.
                            }
                            Some(Err(e)) => {
                                error!(error = %e, "market feed read error");
                                break;
                            }
                        },
                        request = additions.recv() => match request {
                            Some(instruments) => {
                                let fresh: Vec<FeedInstrument> = instruments
                                    .into_iter()
                                    .filter(|i| subscribed.insert(i.clone()))
                                    .collect();
                                if fresh.is_empty() {
                                    continue;
                                }
                                info!(count = fresh.len(), "subscribing additional instruments");
                                if let Err(e) = send_subscription(&mut write, &fresh).await {
                                    error!(error = %e, "subscription send failed — reconnecting");
                                    break;
                                }
                            }
                            None => {
                                info!("feed handle dropped — stopping feed task");
                                return;
                            }
                        },
                    }
                }
            }
            Err(e) => {
                error!(error = %e, backoff_secs = backoff.as_secs(), "market feed connect failed");
            }
        }

        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(BACKOFF_MAX);
    }
}

async fn send_subscription<S>(
    write: &mut S,
    instruments: &[FeedInstrument],
) -> anyhow::Result<()>
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    // The feed accepts at most 100 instruments per request frame.
    for chunk in instruments.chunks(100) {
        let body = json!({
            "RequestCode": SUBSCRIBE_REQUEST_CODE,
            "InstrumentCount": chunk.len(),
            "InstrumentList": chunk
                .iter()
                .map(|i| json!({
                    "ExchangeSegment": i.segment.as_str(),
                    "SecurityId": i.security_id,
                }))
                .collect::<Vec<_>>(),
        });
        write.send(Message::Text(body.to_string())).await?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Frame parsing
// ---------------------------------------------------------------------------

enum ParsedFrame {
    Tick(Tick),
    Disconnect,
    Ignored,
}

fn parse_frame(payload: &[u8]) -> ParsedFrame {
    if payload.len() < 8 {
        return ParsedFrame::Ignored;
    }

    let code = payload[0];
    let segment = match segment_from_code(payload[3]) {
        Some(s) => s,
        None => return ParsedFrame::Ignored,
    };
    let security_id = u32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]);

    match code {
        CODE_TICKER => parse_ticker(payload, segment, security_id),
        CODE_QUOTE => parse_quote(payload, segment, security_id),
        CODE_DISCONNECT => ParsedFrame::Disconnect,
        _ => ParsedFrame::Ignored,
    }
}

/// Ticker packet: ltp f32 at [8..12], exchange time u32 seconds at [12..16].
fn parse_ticker(payload: &[u8], segment: Segment, security_id: u32) -> ParsedFrame {
    if payload.len() < 16 {
        return ParsedFrame::Ignored;
    }
    let ltp = read_f32(payload, 8);
    let ltt = read_u32(payload, 12);
    if !ltp.is_finite() || ltp <= 0.0 {
        return ParsedFrame::Ignored;
    }

    ParsedFrame::Tick(Tick::ltp_only(
        segment,
        security_id.to_string(),
        Money::from_f64(ltp as f64),
        (ltt as i64) * 1000,
    ))
}

/// Quote packet: ltp f32 [8..12], last qty u16 [12..14], exchange time u32
/// [14..18], atp f32 [18..22], volume u32 [22..26], total sell/buy qty u32
/// [26..34], open/close/high/low f32 [34..50].
fn parse_quote(payload: &[u8], segment: Segment, security_id: u32) -> ParsedFrame {
    if payload.len() < 50 {
        return ParsedFrame::Ignored;
    }
    let ltp = read_f32(payload, 8);
    let ltt = read_u32(payload, 14);
    let volume = read_u32(payload, 22);
    let open = read_f32(payload, 34);
    let close = read_f32(payload, 38);
    let high = read_f32(payload, 42);
    let low = read_f32(payload, 46);

    if !ltp.is_finite() || ltp <= 0.0 {
        return ParsedFrame::Ignored;
    }

    ParsedFrame::Tick(Tick {
        segment,
        security_id: security_id.to_string(),
        ltp: Money::from_f64(ltp as f64),
        open: open as f64,
        high: high as f64,
        low: low as f64,
        close: close as f64,
        volume: volume as u64,
        ts: (ltt as i64) * 1000,
    })
}

fn segment_from_code(code: u8) -> Option<Segment> {
    match code {
        0 => Some(Segment::IdxI),
        2 => Some(Segment::NseFno),
        8 => Some(Segment::BseFno),
        _ => None,
    }
}

fn read_f32(payload: &[u8], offset: usize) -> f32 {
    f32::from_le_bytes([
        payload[offset],
        payload[offset + 1],
        payload[offset + 2],
        payload[offset + 3],
    ])
}

fn read_u32(payload: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        payload[offset],
        payload[offset + 1],
        payload[offset + 2],
        payload[offset + 3],
    ])
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn ticker_frame(segment_code: u8, security_id: u32, ltp: f32, ltt: u32) -> Vec<u8> {
        let mut frame = vec![0u8; 16];
        frame[0] = CODE_TICKER;
        frame[1..3].copy_from_slice(&16u16.to_le_bytes());
        frame[3] = segment_code;
        frame[4..8].copy_from_slice(&security_id.to_le_bytes());
        frame[8..12].copy_from_slice(&ltp.to_le_bytes());
        frame[12..16].copy_from_slice(&ltt.to_le_bytes());
        frame
    }

    fn quote_frame(segment_code: u8, security_id: u32) -> Vec<u8> {
        let mut frame = vec![0u8; 50];
        frame[0] = CODE_QUOTE;
        frame[1..3].copy_from_slice(&50u16.to_le_bytes());
        frame[3] = segment_code;
        frame[4..8].copy_from_slice(&security_id.to_le_bytes());
        frame[8..12].copy_from_slice(&104.55f32.to_le_bytes());
        frame[12..14].copy_from_slice(&25u16.to_le_bytes());
        frame[14..18].copy_from_slice(&1_700_000_000u32.to_le_bytes());
        frame[18..22].copy_from_slice(&103.80f32.to_le_bytes());
        frame[22..26].copy_from_slice(&987_654u32.to_le_bytes());
        frame[26..30].copy_from_slice(&10u32.to_le_bytes());
        frame[30..34].copy_from_slice(&12u32.to_le_bytes());
        frame[34..38].copy_from_slice(&100.0f32.to_le_bytes());
        frame[38..42].copy_from_slice(&101.0f32.to_le_bytes());
        frame[42..46].copy_from_slice(&106.0f32.to_le_bytes());
        frame[46..50].copy_from_slice(&99.5f32.to_le_bytes());
        frame
    }

    #[test]
    fn ticker_frame_parses_into_ltp_tick() {
        let frame = ticker_frame(2, 42_501, 104.5, 1_700_000_000);
        match parse_frame(&frame) {
            ParsedFrame::Tick(tick) => {
                assert_eq!(tick.segment, Segment::NseFno);
                assert_eq!(tick.security_id, "42501");
                assert_eq!(tick.ltp, Money::from_f64(104.5));
                assert_eq!(tick.ts, 1_700_000_000_000);
                assert_eq!(tick.volume, 0);
            }
            _ => panic!("expected tick"),
        }
    }

    #[test]
    fn quote_frame_parses_full_ohlcv() {
        let frame = quote_frame(0, 13);
        match parse_frame(&frame) {
            ParsedFrame::Tick(tick) => {
                assert_eq!(tick.segment, Segment::IdxI);
                assert_eq!(tick.security_id, "13");
                assert_eq!(tick.volume, 987_654);
                assert!((tick.high - 106.0).abs() < 1e-3);
                assert!((tick.low - 99.5).abs() < 1e-3);
            }
            _ => panic!("expected tick"),
        }
    }

    #[test]
    fn disconnect_and_noise_frames() {
        let mut frame = ticker_frame(2, 42_501, 104.5, 0);
        frame[0] = CODE_DISCONNECT;
        assert!(matches!(parse_frame(&frame), ParsedFrame::Disconnect));

        // Unknown segment code.
        let frame = ticker_frame(7, 42_501, 104.5, 0);
        assert!(matches!(parse_frame(&frame), ParsedFrame::Ignored));

        // Truncated frame.
        assert!(matches!(parse_frame(&[2, 0, 0]), ParsedFrame::Ignored));

        // Non-positive price.
        let frame = ticker_frame(2, 42_501, 0.0, 0);
        assert!(matches!(parse_frame(&frame), ParsedFrame::Ignored));
    }
}
