use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{OrderStore, PositionStore};
use crate::models::{Order, Position, PositionStatus, TradeStats};
use crate::{Result, TradeError};

const POSITION_COLUMNS: &str = r#"
    id, symbol, exchange, market_type, side, quantity, entry_price, current_price,
    unrealized_pnl, unrealized_pnl_pct, realized_pnl, partial_realized_pnl,
    stop_loss_price, take_profit_price, trailing_stop_price, secure_profit_applied,
    highest_price, lowest_price, leverage, status, open_time, close_time,
    exit_price, exit_reason, entry_order_ids, exit_order_ids, stats,
    pending_exit_client_id, last_fill_at
"#;

const ORDER_COLUMNS: &str = r#"
    id, exchange_order_id, client_order_id, symbol, exchange, market_type, side,
    order_type, quantity, price, executed_qty, avg_fill_price, status,
    strategy_tag, price_incomplete, created_at, updated_at
"#;

/// Postgres-backed order and position store
pub struct PostgresStore {
    pool: PgPool,
}

fn dec(value: f64) -> Result<Decimal> {
    Decimal::try_from(value)
        .map_err(|e| TradeError::Store(format!("cannot store {value} as numeric: {e}")))
}

fn dec_opt(value: Option<f64>) -> Result<Option<Decimal>> {
    value.map(dec).transpose()
}

fn float(row: &PgRow, column: &str) -> Result<f64> {
    let value: Decimal = row.try_get(column)?;
    value
        .to_f64()
        .ok_or_else(|| TradeError::Store(format!("{column} out of range")))
}

fn float_opt(row: &PgRow, column: &str) -> Result<Option<f64>> {
    let value: Option<Decimal> = row.try_get(column)?;
    Ok(value.and_then(|v| v.to_f64()))
}

impl PostgresStore {
    /// Connect and run pending migrations.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::info!("Connected to Postgres, migrations applied");

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    fn order_from_row(row: &PgRow) -> Result<Order> {
        let exchange: String = row.try_get("exchange")?;
        let market_type: String = row.try_get("market_type")?;
        let side: String = row.try_get("side")?;
        let order_type: String = row.try_get("order_type")?;
        let status: String = row.try_get("status")?;

        Ok(Order {
            id: row.try_get("id")?,
            exchange_order_id: row.try_get("exchange_order_id")?,
            client_order_id: row.try_get("client_order_id")?,
            symbol: row.try_get("symbol")?,
            exchange: exchange.parse()?,
            market_type: market_type.parse()?,
            side: side.parse()?,
            order_type: order_type.parse()?,
            quantity: float(row, "quantity")?,
            price: float_opt(row, "price")?,
            executed_qty: float(row, "executed_qty")?,
            avg_fill_price: float_opt(row, "avg_fill_price")?,
            status: status.parse()?,
            strategy_tag: row.try_get("strategy_tag")?,
            price_incomplete: row.try_get("price_incomplete")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn position_from_row(row: &PgRow) -> Result<Position> {
        let exchange: String = row.try_get("exchange")?;
        let market_type: String = row.try_get("market_type")?;
        let side: String = row.try_get("side")?;
        let status: String = row.try_get("status")?;
        let exit_reason: Option<String> = row.try_get("exit_reason")?;
        let close_time: Option<DateTime<Utc>> = row.try_get("close_time")?;
        let stats: Option<Json<TradeStats>> = row.try_get("stats")?;

        Ok(Position {
            id: row.try_get("id")?,
            symbol: row.try_get("symbol")?,
            exchange: exchange.parse()?,
            market_type: market_type.parse()?,
            side: side.parse()?,
            quantity: float(row, "quantity")?,
            entry_price: float(row, "entry_price")?,
            current_price: float(row, "current_price")?,
            unrealized_pnl: float(row, "unrealized_pnl")?,
            unrealized_pnl_pct: float(row, "unrealized_pnl_pct")?,
            realized_pnl: float_opt(row, "realized_pnl")?,
            partial_realized_pnl: float(row, "partial_realized_pnl")?,
            stop_loss_price: float_opt(row, "stop_loss_price")?,
            take_profit_price: float_opt(row, "take_profit_price")?,
            trailing_stop_price: float_opt(row, "trailing_stop_price")?,
            secure_profit_applied: row.try_get("secure_profit_applied")?,
            highest_price: float(row, "highest_price")?,
            lowest_price: float(row, "lowest_price")?,
            leverage: float(row, "leverage")?,
            status: status.parse()?,
            open_time: row.try_get("open_time")?,
            close_time,
            exit_price: float_opt(row, "exit_price")?,
            exit_reason: exit_reason.map(|r| r.parse()).transpose()?,
            entry_order_ids: row.try_get("entry_order_ids")?,
            exit_order_ids: row.try_get("exit_order_ids")?,
            stats: stats.map(|Json(s)| s),
            pending_exit_client_id: row.try_get("pending_exit_client_id")?,
            last_fill_at: row.try_get("last_fill_at")?,
        })
    }

    async fn query_positions(&self, sql: String, binds: &[&str]) -> Result<Vec<Position>> {
        let mut query = sqlx::query(&sql);
        for b in binds {
            query = query.bind(*b);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(Self::position_from_row).collect()
    }
}

#[async_trait]
impl OrderStore for PostgresStore {
    async fn save(&self, order: &Order) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO orders (
                id, exchange_order_id, client_order_id, symbol, exchange, market_type,
                side, order_type, quantity, price, executed_qty, avg_fill_price,
                status, strategy_tag, price_incomplete, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ON CONFLICT (id) DO UPDATE SET
                exchange_order_id = EXCLUDED.exchange_order_id,
                executed_qty = EXCLUDED.executed_qty,
                avg_fill_price = EXCLUDED.avg_fill_price,
                status = EXCLUDED.status,
                price_incomplete = EXCLUDED.price_incomplete,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(order.id)
        .bind(&order.exchange_order_id)
        .bind(&order.client_order_id)
        .bind(&order.symbol)
        .bind(order.exchange.as_str())
        .bind(order.market_type.as_str())
        .bind(order.side.as_str())
        .bind(order.order_type.as_str())
        .bind(dec(order.quantity)?)
        .bind(dec_opt(order.price)?)
        .bind(dec(order.executed_qty)?)
        .bind(dec_opt(order.avg_fill_price)?)
        .bind(order.status.as_str())
        .bind(&order.strategy_tag)
        .bind(order.price_incomplete)
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&self.pool)
        .await?;

        tracing::debug!("Saved order {} ({}) to Postgres", order.id, order.client_order_id);
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Order>> {
        let row = sqlx::query(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::order_from_row).transpose()
    }

    async fn find_by_client_id(&self, client_order_id: &str) -> Result<Option<Order>> {
        let row = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE client_order_id = $1"
        ))
        .bind(client_order_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::order_from_row).transpose()
    }

    async fn find_by_symbol(&self, symbol: &str) -> Result<Vec<Order>> {
        let rows = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE symbol = $1 ORDER BY created_at DESC"
        ))
        .bind(symbol)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::order_from_row).collect()
    }
}

#[async_trait]
impl PositionStore for PostgresStore {
    async fn save(&self, position: &Position) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO positions (
                id, symbol, exchange, market_type, side, quantity, entry_price, current_price,
                unrealized_pnl, unrealized_pnl_pct, realized_pnl, partial_realized_pnl,
                stop_loss_price, take_profit_price, trailing_stop_price, secure_profit_applied,
                highest_price, lowest_price, leverage, status, open_time, close_time,
                exit_price, exit_reason, entry_order_ids, exit_order_ids, stats,
                pending_exit_client_id, last_fill_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                    $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $28, $29)
            ON CONFLICT (id) DO UPDATE SET
                quantity = EXCLUDED.quantity,
                entry_price = EXCLUDED.entry_price,
                current_price = EXCLUDED.current_price,
                unrealized_pnl = EXCLUDED.unrealized_pnl,
                unrealized_pnl_pct = EXCLUDED.unrealized_pnl_pct,
                realized_pnl = EXCLUDED.realized_pnl,
                partial_realized_pnl = EXCLUDED.partial_realized_pnl,
                stop_loss_price = EXCLUDED.stop_loss_price,
                take_profit_price = EXCLUDED.take_profit_price,
                trailing_stop_price = EXCLUDED.trailing_stop_price,
                secure_profit_applied = EXCLUDED.secure_profit_applied,
                highest_price = EXCLUDED.highest_price,
                lowest_price = EXCLUDED.lowest_price,
                leverage = EXCLUDED.leverage,
                status = EXCLUDED.status,
                close_time = EXCLUDED.close_time,
                exit_price = EXCLUDED.exit_price,
                exit_reason = EXCLUDED.exit_reason,
                entry_order_ids = EXCLUDED.entry_order_ids,
                exit_order_ids = EXCLUDED.exit_order_ids,
                stats = EXCLUDED.stats,
                pending_exit_client_id = EXCLUDED.pending_exit_client_id,
                last_fill_at = EXCLUDED.last_fill_at,
                updated_at = NOW()
            "#,
        )
        .bind(position.id)
        .bind(&position.symbol)
        .bind(position.exchange.as_str())
        .bind(position.market_type.as_str())
        .bind(position.side.as_str())
        .bind(dec(position.quantity)?)
        .bind(dec(position.entry_price)?)
        .bind(dec(position.current_price)?)
        .bind(dec(position.unrealized_pnl)?)
        .bind(dec(position.unrealized_pnl_pct)?)
        .bind(dec_opt(position.realized_pnl)?)
        .bind(dec(position.partial_realized_pnl)?)
        .bind(dec_opt(position.stop_loss_price)?)
        .bind(dec_opt(position.take_profit_price)?)
        .bind(dec_opt(position.trailing_stop_price)?)
        .bind(position.secure_profit_applied)
        .bind(dec(position.highest_price)?)
        .bind(dec(position.lowest_price)?)
        .bind(dec(position.leverage)?)
        .bind(position.status.as_str())
        .bind(position.open_time)
        .bind(position.close_time)
        .bind(dec_opt(position.exit_price)?)
        .bind(position.exit_reason.map(|r| r.as_str()))
        .bind(&position.entry_order_ids)
        .bind(&position.exit_order_ids)
        .bind(position.stats.as_ref().map(Json))
        .bind(position.pending_exit_client_id.as_deref())
        .bind(position.last_fill_at)
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            "Saved position {} for {} ({}) to Postgres",
            position.id,
            position.symbol,
            position.status.as_str()
        );
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Position>> {
        let row = sqlx::query(&format!(
            "SELECT {POSITION_COLUMNS} FROM positions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::position_from_row).transpose()
    }

    async fn find_by_status(&self, status: PositionStatus) -> Result<Vec<Position>> {
        self.query_positions(
            format!("SELECT {POSITION_COLUMNS} FROM positions WHERE status = $1 ORDER BY open_time ASC"),
            &[status.as_str()],
        )
        .await
    }

    async fn find_by_symbol_and_status(
        &self,
        symbol: &str,
        status: PositionStatus,
    ) -> Result<Vec<Position>> {
        self.query_positions(
            format!(
                "SELECT {POSITION_COLUMNS} FROM positions \
                 WHERE symbol = $1 AND status = $2 ORDER BY open_time ASC"
            ),
            &[symbol, status.as_str()],
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExchangeId, MarketType, PositionSide};

    #[test]
    fn test_decimal_conversion() {
        assert_eq!(dec(1.5).unwrap().to_f64(), Some(1.5));
        assert!(dec(f64::NAN).is_err());
        assert_eq!(dec_opt(None).unwrap(), None);
    }

    #[tokio::test]
    #[ignore] // Requires Postgres running (DATABASE_URL)
    async fn test_position_round_trip() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL");
        let store = PostgresStore::connect(&url).await.unwrap();

        let mut position = Position::open(
            ExchangeId::Paper,
            MarketType::Linear,
            &format!("T{}USDT", Uuid::new_v4().simple()),
            PositionSide::Long,
            0.5,
            64000.0,
            Utc::now(),
        );
        position.stop_loss_price = Some(62000.0);
        PositionStore::save(&store, &position).await.unwrap();

        let loaded = PositionStore::find_by_id(&store, position.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.symbol, position.symbol);
        assert_eq!(loaded.stop_loss_price, Some(62000.0));
        assert_eq!(loaded.status, PositionStatus::Open);

        // A second OPEN row for the same key violates the partial unique index
        let twin = Position::open(
            ExchangeId::Paper,
            MarketType::Linear,
            &position.symbol,
            PositionSide::Long,
            1.0,
            1.0,
            Utc::now(),
        );
        assert!(PositionStore::save(&store, &twin).await.is_err());
    }
}
