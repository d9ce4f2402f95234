// =============================================================================
// Candle Stream — OKX business websocket, one connection per timeframe
// =============================================================================
//
// One connection subscribes `candle<bar>` for every watchlist instrument.
// OKX pushes the forming candle on every update; only rows with
// `confirm == "1"` (the candle has closed) are forwarded.
//
// The server drops idle connections after 30s, so a literal "ping" text frame
// is sent every 20s and the "pong" reply is swallowed.
//
// Reconnection is owned by the caller:
//
// ```ignore
// loop {
//     if let Err(e) = run_candle_stream(&url, "15m", &symbols, &tx).await {
//         error!(error = %e, "candle stream error");
//     }
//     tokio::time::sleep(Duration::from_secs(5)).await;
// }
// ```
// =============================================================================

use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::exchange::wire::{okx_bar, parse_candle_row, WsPush};
use crate::types::CandleTick;

/// Interval of the keep-alive text ping.
pub const PING_EVERY: Duration = Duration::from_secs(20);

/// A decoded text frame.
#[derive(Debug, PartialEq)]
pub enum Frame {
    /// Closed candles carried by a push (possibly empty when every row was
    /// still forming).
    Candles(Vec<CandleTick>),
    /// Subscribe acknowledgement.
    Subscribed(String),
    Pong,
    Other,
}

/// Subscribe frame for `candle<bar>` on every symbol.
pub fn subscribe_frame(timeframe: &str, symbols: &[String]) -> String {
    let channel = format!("candle{}", okx_bar(timeframe));
    let args: Vec<serde_json::Value> = symbols
        .iter()
        .map(|s| json!({ "channel": channel, "instId": s }))
        .collect();
    json!({ "op": "subscribe", "args": args }).to_string()
}

/// Decode one text frame. An `error` event is returned as `Err`.
pub fn parse_frame(text: &str) -> Result<Frame> {
    if text == "pong" {
        return Ok(Frame::Pong);
    }
    let push: WsPush = serde_json::from_str(text).context("failed to parse websocket frame")?;

    if let Some(event) = push.event.as_deref() {
        return match event {
            "error" => bail!(
                "websocket error event (code {}): {}",
                push.code.unwrap_or_default(),
                push.msg.unwrap_or_default()
            ),
            "subscribe" => Ok(Frame::Subscribed(
                push.arg.map(|a| format!("{}:{}", a.channel, a.inst_id)).unwrap_or_default(),
            )),
            _ => Ok(Frame::Other),
        };
    }

    let Some(arg) = push.arg else {
        return Ok(Frame::Other);
    };
    let Some(bar) = arg.channel.strip_prefix("candle") else {
        return Ok(Frame::Other);
    };

    let candles = push
        .data
        .iter()
        .filter_map(|row| parse_candle_row(&arg.inst_id, bar, row))
        .filter(|(_, confirmed)| *confirmed)
        .map(|(tick, _)| tick)
        .collect();
    Ok(Frame::Candles(candles))
}

/// Stream closed candles of `timeframe` for `symbols` into `tx`.
///
/// Returns `Ok(())` when the server ends the stream or the receiver is gone,
/// and an error on connect, read or protocol failure.
pub async fn run_candle_stream(
    url: &str,
    timeframe: &str,
    symbols: &[String],
    tx: &mpsc::Sender<CandleTick>,
) -> Result<()> {
    if symbols.is_empty() {
        bail!("no symbols to subscribe for {timeframe}");
    }
    info!(url = %url, tf = %timeframe, symbols = symbols.len(), "connecting to candle WebSocket");

    let (ws_stream, _response) = connect_async(url)
        .await
        .context("failed to connect to candle WebSocket")?;
    let (mut write, mut read) = ws_stream.split();

    write
        .send(Message::Text(subscribe_frame(timeframe, symbols)))
        .await
        .context("failed to send subscribe frame")?;
    info!(tf = %timeframe, "candle WebSocket connected and subscribed");

    let mut ping = tokio::time::interval(PING_EVERY);
    ping.tick().await;

    loop {
        tokio::select! {
            _ = ping.tick() => {
                write
                    .send(Message::Text("ping".into()))
                    .await
                    .context("failed to send ping")?;
            }
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => match parse_frame(&text) {
                    Ok(Frame::Candles(candles)) => {
                        for c in candles {
                            debug!(inst = %c.inst_id, tf = %c.timeframe, close = c.close, end = %c.end, "candle closed");
                            if tx.send(c).await.is_err() {
                                warn!(tf = %timeframe, "candle receiver dropped, closing stream");
                                return Ok(());
                            }
                        }
                    }
                    Ok(Frame::Subscribed(what)) => debug!(channel = %what, "subscribed"),
                    Ok(Frame::Pong) | Ok(Frame::Other) => {}
                    Err(e) => {
                        error!(tf = %timeframe, error = %e, "candle WebSocket protocol error");
                        return Err(e);
                    }
                },
                Some(Ok(Message::Close(frame))) => {
                    warn!(tf = %timeframe, frame = ?frame, "candle WebSocket closed by server");
                    return Ok(());
                }
                // Ping / Pong / Binary frames; tungstenite answers pings itself.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!(tf = %timeframe, error = %e, "candle WebSocket read error");
                    return Err(e.into());
                }
                None => {
                    warn!(tf = %timeframe, "candle WebSocket stream ended");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_uses_okx_bar_labels() {
        let frame = subscribe_frame("1h", &["BTC-USDT-SWAP".into(), "ETH-USDT-SWAP".into()]);
        let v: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(v["op"], "subscribe");
        assert_eq!(v["args"][0]["channel"], "candle1H");
        assert_eq!(v["args"][1]["instId"], "ETH-USDT-SWAP");
    }

    #[test]
    fn only_confirmed_rows_are_emitted() {
        let text = r#"{"arg":{"channel":"candle15m","instId":"BTC-USDT-SWAP"},"data":[
            ["1714557600000","100","101","99","100.5","12","0","0","1"],
            ["1714558500000","100.5","102","100","101","3","0","0","0"]]}"#;
        let Frame::Candles(c) = parse_frame(text).unwrap() else {
            panic!("expected candles");
        };
        assert_eq!(c.len(), 1);
        assert_eq!(c[0].timeframe, "15m");
        assert_eq!(c[0].close, 100.5);
        assert_eq!((c[0].end - c[0].start).num_minutes(), 15);
    }

    #[test]
    fn hourly_channel_normalises_timeframe() {
        let text = r#"{"arg":{"channel":"candle1H","instId":"ETH-USDT-SWAP"},"data":[
            ["1714557600000","1","2","0.5","1.5","1","0","0","1"]]}"#;
        let Frame::Candles(c) = parse_frame(text).unwrap() else {
            panic!("expected candles");
        };
        assert_eq!(c[0].timeframe, "1h");
        assert_eq!(c[0].inst_id, "ETH-USDT-SWAP");
    }

    #[test]
    fn events_and_pong() {
        assert_eq!(parse_frame("pong").unwrap(), Frame::Pong);
        let sub = r#"{"event":"subscribe","arg":{"channel":"candle1m","instId":"BTC-USDT-SWAP"}}"#;
        assert_eq!(
            parse_frame(sub).unwrap(),
            Frame::Subscribed("candle1m:BTC-USDT-SWAP".into())
        );
        let err = r#"{"event":"error","code":"60012","msg":"Invalid request"}"#;
        assert!(parse_frame(err).unwrap_err().to_string().contains("60012"));
        assert!(parse_frame("not json").is_err());
    }
}
