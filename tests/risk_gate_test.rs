mod common;

use common::{harness, market};
use tradecore::risk::kelly_fraction;
use tradecore::{ExchangeId, MarketType, OrderSide, PositionSide, TradeDecision, TradeProposal};

fn btc_long(size: f64) -> TradeProposal {
    TradeProposal::new("BTCUSDT", MarketType::Linear, PositionSide::Long, size)
}

#[tokio::test]
async fn test_single_coin_cap_rejects_six_accepts_four() {
    let h = harness();

    // $10,000 balance, 5% cap, $100 price
    let six = h.core.validate_trade(&btc_long(6.0), ExchangeId::Paper, 10_000.0).await.unwrap();
    assert!(!six.is_accepted());
    println!("size 6: {:?}", six.reason());

    let four = h.core.validate_trade(&btc_long(4.0), ExchangeId::Paper, 10_000.0).await.unwrap();
    assert_eq!(four, TradeDecision::Accept);
}

#[test]
fn test_kelly_fraction_clamps_to_quarter() {
    // b = 2, f = (2 * 0.6 - 0.4) / 2 = 0.4 -> 0.25
    assert_eq!(kelly_fraction(0.6, 100.0, 50.0), 0.25);
}

#[tokio::test]
async fn test_position_size_capped_by_kelly_after_history() {
    let h = harness();

    // Three +100 wins and two -50 losses on 10 BTC at $100
    for exit in [110.0, 110.0, 110.0, 95.0, 95.0] {
        h.venue.set_price("BTCUSDT", 100.0);
        h.core.place_order(&market(OrderSide::Buy, 10.0), ExchangeId::Paper).await.unwrap();
        h.venue.set_price("BTCUSDT", exit);
        h.core.place_order(&market(OrderSide::Sell, 10.0), ExchangeId::Paper).await.unwrap();
    }
    h.venue.set_price("BTCUSDT", 100.0);

    // Fixed-fractional alone would be 10_000 * 1% / 0.1 = 1000 units
    let size = h
        .core
        .calculate_position_size(
            "BTCUSDT",
            MarketType::Linear,
            PositionSide::Long,
            ExchangeId::Paper,
            10_000.0,
            Some(99.9),
        )
        .await
        .unwrap();
    assert_eq!(size, Some(25.0));
}

#[tokio::test]
async fn test_drawdown_breaker_blocks_new_trades() {
    let h = harness();
    h.core.refresh_portfolio().await.unwrap();
    h.venue.set_balance(9_400.0);
    assert_eq!(h.core.refresh_portfolio().await.unwrap(), Some(9_400.0));

    let decision = h.core.validate_trade(&btc_long(1.0), ExchangeId::Paper, 9_400.0).await.unwrap();
    assert!(decision.reason().unwrap().contains("circuit breaker"));
}

#[tokio::test]
async fn test_default_exits_keep_two_to_one() {
    let h = harness();
    let (sl, tp) = h
        .core
        .default_exits("BTCUSDT", MarketType::Linear, PositionSide::Short, ExchangeId::Paper, 100.0)
        .await
        .unwrap();
    assert!(sl > 100.0);
    assert!(((tp - 100.0).abs() / (sl - 100.0) - 2.0).abs() < 1e-9);
}
