// =============================================================================
// Binance exchange source
// =============================================================================
//
// Implements `ExchangeSource` against Binance's public market-data WS/REST
// endpoints. Grounded in `market_data::candle_buffer::run_kline_stream` (the
// connect-and-forward-until-disconnect shape), `market_data::trade_stream
// ::run_trade_stream` (the aggTrade parsing shape), and
// `binance::client::BinanceClient::get_klines` (the public REST backfill
// call). The private, HMAC-signed endpoints (`sign`, `place_order`,
// `get_account`) have no counterpart here — this core never places orders.
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc::Sender;
use tokio_tungstenite::connect_async;
use tracing::{debug, warn};

use crate::ports::{BarEvent, ExchangeSource, TradeEvent};
use crate::types::{Bar, Instrument, Timeframe, Trade};

const REST_BASE_URL: &str = "https://api.binance.com";
const WS_BASE_URL: &str = "wss://stream.binance.com:9443/ws";

pub struct BinanceExchangeSource {
    http: reqwest::Client,
}

impl BinanceExchangeSource {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("failed to build reqwest client"),
        }
    }
}

impl Default for BinanceExchangeSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExchangeSource for BinanceExchangeSource {
    async fn subscribe_bars_1m(&self, instrument: &Instrument, tx: Sender<BarEvent>) -> Result<()> {
        let lower = instrument.to_lowercase();
        let url = format!("{WS_BASE_URL}/{lower}@kline_1m");
        debug!(url = %url, instrument, "connecting to kline stream");

        let (ws_stream, _response) = connect_async(&url).await.context("failed to connect to kline WebSocket")?;
        let (_write, mut read) = ws_stream.split();

        while let Some(msg) = read.next().await {
            match msg {
                Ok(tokio_tungstenite::tungstenite::Message::Text(text)) => {
                    match parse_kline(&text) {
                        Ok(Some(bar)) => {
                            if tx.send(BarEvent { timeframe: Timeframe::OneMin, bar }).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => warn!(error = %e, "failed to parse kline message"),
                    }
                }
                Ok(_) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn subscribe_trades(&self, instrument: &Instrument, tx: Sender<TradeEvent>) -> Result<()> {
        let lower = instrument.to_lowercase();
        let url = format!("{WS_BASE_URL}/{lower}@aggTrade");
        debug!(url = %url, instrument, "connecting to trade stream");

        let (ws_stream, _response) = connect_async(&url).await.context("failed to connect to trade WebSocket")?;
        let (_write, mut read) = ws_stream.split();

        while let Some(msg) = read.next().await {
            match msg {
                Ok(tokio_tungstenite::tungstenite::Message::Text(text)) => {
                    match parse_agg_trade(&text) {
                        Ok(trade) => {
                            if tx.send(TradeEvent { trade }).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "failed to parse aggTrade message"),
                    }
                }
                Ok(_) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn fetch_bars(&self, instrument: &Instrument, from: i64, to: i64) -> Result<Vec<Bar>> {
        let url = format!(
            "{REST_BASE_URL}/api/v3/klines?symbol={instrument}&interval=1m&startTime={from}&endTime={to}&limit=1000"
        );
        let resp = self.http.get(&url).send().await.context("GET /api/v3/klines request failed")?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("failed to parse klines response")?;
        if !status.is_success() {
            anyhow::bail!("Binance GET /api/v3/klines returned {status}: {body}");
        }

        let raw = body.as_array().context("klines response is not an array")?;
        let mut bars = Vec::with_capacity(raw.len());
        for entry in raw {
            let arr = entry.as_array().context("kline entry is not an array")?;
            if arr.len() < 11 {
                warn!(len = arr.len(), "skipping malformed kline entry");
                continue;
            }
            let open_time = arr[0].as_i64().unwrap_or(0);
            let open = parse_str_f64(&arr[1])?;
            let high = parse_str_f64(&arr[2])?;
            let low = parse_str_f64(&arr[3])?;
            let close = parse_str_f64(&arr[4])?;
            let volume = parse_str_f64(&arr[5])?;
            bars.push(Bar { open_time, open, high, low, close, volume, closed: true });
        }
        Ok(bars)
    }
}

fn parse_str_f64(val: &serde_json::Value) -> Result<f64> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>().with_context(|| format!("failed to parse '{s}' as f64"))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        anyhow::bail!("expected string or number, got: {val}")
    }
}

fn parse_kline(text: &str) -> Result<Option<Bar>> {
    let root: serde_json::Value = serde_json::from_str(text).context("failed to parse kline JSON")?;
    let k = &root["k"];
    if k.is_null() {
        return Ok(None);
    }
    let is_closed = k["x"].as_bool().context("missing field k.x")?;
    let open_time = k["t"].as_i64().context("missing field k.t")?;
    let open = parse_str_f64(&k["o"])?;
    let high = parse_str_f64(&k["h"])?;
    let low = parse_str_f64(&k["l"])?;
    let close = parse_str_f64(&k["c"])?;
    let volume = parse_str_f64(&k["v"])?;
    Ok(Some(Bar { open_time, open, high, low, close, volume, closed: is_closed }))
}

fn parse_agg_trade(text: &str) -> Result<Trade> {
    let root: serde_json::Value = serde_json::from_str(text).context("failed to parse aggTrade JSON")?;
    let price: f64 = root["p"].as_str().context("missing field p")?.parse().context("failed to parse price")?;
    let quantity: f64 = root["q"].as_str().context("missing field q")?.parse().context("failed to parse quantity")?;
    let timestamp_ms = root["T"].as_i64().unwrap_or(0);
    Ok(Trade { timestamp_ms, price, quantity })
}
