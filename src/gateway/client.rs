//! Alpaca REST API client.

use crate::config::AlpacaConfig;
use crate::gateway::error::{GatewayError, GatewayResult};
use crate::gateway::traits::BrokerGateway;
use crate::gateway::types::*;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};

const PAPER_TRADING_URL: &str = "https://paper-api.alpaca.markets";
const LIVE_TRADING_URL: &str = "https://api.alpaca.markets";
const MARKET_DATA_URL: &str = "https://data.alpaca.markets";

/// Alpaca client covering both the trading and the market data APIs.
pub struct AlpacaClient {
    http: Client,
    api_key: String,
    secret_key: String,
    trading_url: String,
    data_url: String,
}

impl AlpacaClient {
    /// Create a new Alpaca client from configuration.
    pub fn new(config: &AlpacaConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        let trading_url = config.trading_url.clone().unwrap_or_else(|| {
            if config.paper {
                PAPER_TRADING_URL.to_string()
            } else {
                LIVE_TRADING_URL.to_string()
            }
        });
        let data_url = config
            .data_url
            .clone()
            .unwrap_or_else(|| MARKET_DATA_URL.to_string());

        Ok(Self {
            http,
            api_key: config.api_key.clone(),
            secret_key: config.secret_key.clone(),
            trading_url: trading_url.trim_end_matches('/').to_string(),
            data_url: data_url.trim_end_matches('/').to_string(),
        })
    }

    /// Base URL used for order routing.
    pub fn trading_url(&self) -> &str {
        &self.trading_url
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("APCA-API-KEY-ID", &self.api_key)
            .header("APCA-API-SECRET-KEY", &self.secret_key)
    }

    /// Send a request, mapping non-2xx responses to [`GatewayError::Api`].
    async fn send(&self, builder: RequestBuilder) -> GatewayResult<reqwest::Response> {
        let response = self.authed(builder).send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(GatewayError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }

    async fn send_json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> GatewayResult<T> {
        let response = self.send(builder).await?;
        response
            .json()
            .await
            .map_err(|e| GatewayError::Decode(e.to_string()))
    }
}

#[async_trait]
impl BrokerGateway for AlpacaClient {
    #[instrument(skip(self))]
    async fn get_clock(&self) -> GatewayResult<Clock> {
        let url = format!("{}/v2/clock", self.trading_url);
        self.send_json(self.http.get(&url)).await
    }

    #[instrument(skip(self))]
    async fn get_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: u32,
    ) -> GatewayResult<Vec<Bar>> {
        let url = format!("{}/v2/stocks/{}/bars", self.data_url, symbol);
        // Newest first so `limit` keeps the most recent bars, then flip back
        let limit = limit.to_string();
        let request = self.http.get(&url).query(&[
            ("timeframe", timeframe.as_str()),
            ("limit", limit.as_str()),
            ("sort", "desc"),
        ]);
        let response: BarsResponse = self.send_json(request).await?;

        let mut bars = response.bars.unwrap_or_default();
        bars.reverse();
        debug!(%symbol, count = bars.len(), "Fetched bars");
        Ok(bars)
    }

    #[instrument(skip(self))]
    async fn get_account(&self) -> GatewayResult<Account> {
        let url = format!("{}/v2/account", self.trading_url);
        self.send_json(self.http.get(&url)).await
    }

    #[instrument(skip(self))]
    async fn get_positions(&self) -> GatewayResult<Vec<Position>> {
        let url = format!("{}/v2/positions", self.trading_url);
        let raw: Vec<RawPosition> = self.send_json(self.http.get(&url)).await?;
        Ok(raw.into_iter().map(Position::from).collect())
    }

    #[instrument(skip(self))]
    async fn get_open_orders(&self) -> GatewayResult<Vec<Order>> {
        let url = format!("{}/v2/orders", self.trading_url);
        let request = self
            .http
            .get(&url)
            .query(&[("status", "open"), ("direction", "desc")]);
        self.send_json(request).await
    }

    #[instrument(skip(self))]
    async fn cancel_order(&self, order_id: &str) -> GatewayResult<()> {
        let url = format!("{}/v2/orders/{}", self.trading_url, order_id);
        self.send(self.http.delete(&url)).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(symbol = %order.symbol, qty = order.quantity, side = %order.side))]
    async fn create_order(&self, order: &OrderRequest) -> GatewayResult<Order> {
        let url = format!("{}/v2/orders", self.trading_url);
        self.send_json(self.http.post(&url).json(order)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use tokio_test::{assert_err, assert_ok};
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> AlpacaClient {
        AlpacaClient::new(&AlpacaConfig {
            api_key: "key".to_string(),
            secret_key: "secret".to_string(),
            paper: true,
            trading_url: Some(server.uri()),
            data_url: Some(server.uri()),
        })
        .unwrap()
    }

    #[test]
    fn test_paper_flag_selects_endpoint() {
        let mut config = AlpacaConfig::default();
        config.paper = true;
        assert_eq!(
            AlpacaClient::new(&config).unwrap().trading_url(),
            PAPER_TRADING_URL
        );

        config.paper = false;
        assert_eq!(
            AlpacaClient::new(&config).unwrap().trading_url(),
            LIVE_TRADING_URL
        );
    }

    #[tokio::test]
    async fn test_get_clock_sends_auth_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/clock"))
            .and(header("APCA-API-KEY-ID", "key"))
            .and(header("APCA-API-SECRET-KEY", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "timestamp": "2024-03-04T10:15:00.123-05:00",
                "is_open": true,
                "next_open": "2024-03-05T09:30:00-05:00",
                "next_close": "2024-03-04T16:00:00-05:00"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let clock = client_for(&server).get_clock().await.unwrap();

        assert!(clock.is_open);
        let remaining = clock.next_close - clock.timestamp;
        assert_eq!(remaining.num_minutes(), 344);
    }

    #[tokio::test]
    async fn test_get_bars_returns_oldest_first() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/stocks/AAPL/bars"))
            .and(query_param("timeframe", "1Min"))
            .and(query_param("limit", "2"))
            .and(query_param("sort", "desc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "symbol": "AAPL",
                "next_page_token": null,
                "bars": [
                    {"t": "2024-03-04T15:01:00Z", "o": 101.0, "h": 102.0, "l": 100.5, "c": 101.5, "v": 900},
                    {"t": "2024-03-04T15:00:00Z", "o": 100.0, "h": 101.0, "l": 99.5, "c": 100.5, "v": 1200}
                ]
            })))
            .mount(&server)
            .await;

        let bars = client_for(&server)
            .get_bars("AAPL", Timeframe::Minute, 2)
            .await
            .unwrap();

        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].open, dec!(100.0));
        assert_eq!(bars[1].close, dec!(101.5));
    }

    #[tokio::test]
    async fn test_get_bars_null_is_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/stocks/ZZZZ/bars"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "symbol": "ZZZZ",
                "bars": null,
                "next_page_token": null
            })))
            .mount(&server)
            .await;

        let bars = client_for(&server)
            .get_bars("ZZZZ", Timeframe::Minute, 10)
            .await
            .unwrap();
        assert!(bars.is_empty());
    }

    #[tokio::test]
    async fn test_get_account_and_positions() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/account"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "equity": "100000.50",
                "buying_power": "200001.00",
                "portfolio_value": "100000.50"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/positions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"symbol": "MSFT", "qty": "15", "side": "long", "market_value": "6000.00"},
                {"symbol": "F", "qty": "-40", "side": "short", "market_value": "-480.00"}
            ])))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let account = client.get_account().await.unwrap();
        let positions = client.get_positions().await.unwrap();

        assert_eq!(account.equity, dec!(100000.50));
        assert_eq!(positions.len(), 2);
        assert_eq!(positions[1].side, PositionSide::Short);
        assert_eq!(positions[1].quantity, 40);
    }

    #[tokio::test]
    async fn test_create_order_posts_market_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/orders"))
            .and(body_json(serde_json::json!({
                "symbol": "AAPL",
                "qty": 3,
                "side": "buy",
                "type": "market",
                "time_in_force": "day"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "ord-1",
                "symbol": "AAPL",
                "side": "buy",
                "status": "accepted",
                "qty": "3"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let order = client_for(&server)
            .create_order(&OrderRequest::market("AAPL", 3, OrderSide::Buy))
            .await
            .unwrap();

        assert_eq!(order.id, "ord-1");
        assert_eq!(order.qty, Some(dec!(3)));
    }

    #[tokio::test]
    async fn test_rejected_order_maps_to_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/orders"))
            .respond_with(
                ResponseTemplate::new(403).set_body_string(r#"{"message":"insufficient buying power"}"#),
            )
            .mount(&server)
            .await;

        let result = client_for(&server)
            .create_order(&OrderRequest::market("AAPL", 3, OrderSide::Buy))
            .await;

        match assert_err!(result) {
            GatewayError::Api { status, message } => {
                assert_eq!(status, 403);
                assert!(message.contains("insufficient buying power"));
            }
            other => panic!("Expected Api error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_open_orders_and_cancel() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/orders"))
            .and(query_param("status", "open"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"id": "a1", "symbol": "AAPL", "side": "sell", "status": "new", "qty": "5"}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/v2/orders/a1"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let orders = client.get_open_orders().await.unwrap();
        assert_eq!(orders.len(), 1);
        assert_ok!(client.cancel_order(&orders[0].id).await);
    }
}
