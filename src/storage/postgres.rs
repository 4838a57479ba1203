use crate::core::Clock;
use crate::exchange::registry::{ApiCredentials, CredentialSource};
use crate::models::{Interval, Order, OrderStatus, Side};
use crate::storage::{
    datetime_from_ms, ExchangeRef, NewOrder, OrderChanges, OrderFilter, OrderPatch,
    OrderRepository,
};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use postgres::types::ToSql;
use postgres::{Client, GenericClient, NoTls, Row};
use rust_decimal::Decimal;
use std::sync::Arc;

const SCHEMA_SQL: &str = include_str!("../../DB_SCHEMA.sql");

const ORDER_COLUMNS: &str = "id, user_id, exchange_id, api_key_id, is_testnet, symbol, side, \
     quantity, status, entry_price, max_entry, take_profit, stop_loss, entry_interval, \
     stop_interval, executed_price, executed_at, closed_at, sl_updated_at, tp_order_id, \
     created_at, updated_at";

pub struct PostgresRepository {
    dsn: String,
    clock: Arc<dyn Clock>,
}

impl PostgresRepository {
    pub fn new(dsn: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            dsn: dsn.into(),
            clock,
        }
    }

    pub fn ensure_schema(&self) -> Result<()> {
        let mut client = self.connect()?;
        for statement in split_statements(SCHEMA_SQL) {
            if statement.trim().is_empty() {
                continue;
            }
            client
                .batch_execute(&statement)
                .map_err(|err| Error::new(format!("schema execute failed: {err}")))?;
        }
        Ok(())
    }

    fn connect(&self) -> Result<Client> {
        Client::connect(&self.dsn, NoTls)
            .map_err(|err| Error::new(format!("postgres connect failed: {err}")))
    }

    fn now(&self) -> DateTime<Utc> {
        datetime_from_ms(self.clock.now_ms())
    }
}

impl OrderRepository for PostgresRepository {
    fn insert(&self, order: NewOrder) -> Result<Order> {
        let mut client = self.connect()?;
        let now = self.now();
        let sql = format!(
            "INSERT INTO orders (user_id, exchange_id, api_key_id, is_testnet, symbol, side, \
             quantity, status, entry_price, max_entry, take_profit, stop_loss, entry_interval, \
             stop_interval, executed_price, executed_at, tp_order_id, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, \
             $18, $19) RETURNING {ORDER_COLUMNS}"
        );
        let row = client
            .query_one(
                &sql,
                &[
                    &order.user_id,
                    &order.exchange_id,
                    &order.api_key_id,
                    &order.is_testnet,
                    &order.symbol,
                    &order.side.as_str(),
                    &order.quantity,
                    &order.status.as_str(),
                    &order.entry_price,
                    &order.max_entry,
                    &order.take_profit,
                    &order.stop_loss,
                    &order.entry_interval.as_str(),
                    &order.stop_interval.as_str(),
                    &order.executed_price,
                    &order.executed_at,
                    &order.tp_order_id,
                    &now,
                    &now,
                ],
            )
            .map_err(|err| Error::new(format!("insert order failed: {err}")))?;
        row_to_order(&row)
    }

    fn load(&self, id: i64) -> Result<Option<Order>> {
        let mut client = self.connect()?;
        let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1");
        let row = client
            .query_opt(&sql, &[&id])
            .map_err(|err| Error::new(format!("load order failed: {err}")))?;
        row.map(|row| row_to_order(&row)).transpose()
    }

    fn list_non_terminal(&self) -> Result<Vec<Order>> {
        let mut client = self.connect()?;
        let sql = format!(
            "SELECT {ORDER_COLUMNS} FROM orders \
             WHERE status IN ('PENDING', 'IN_EXECUTION', 'EXECUTED') ORDER BY id"
        );
        let rows = client
            .query(&sql, &[])
            .map_err(|err| Error::new(format!("list orders failed: {err}")))?;
        rows.iter().map(row_to_order).collect()
    }

    fn list_by(&self, filter: &OrderFilter) -> Result<Vec<Order>> {
        let mut client = self.connect()?;
        let status_text = filter.status.map(|status| status.as_str().to_string());
        let mut clauses: Vec<String> = Vec::new();
        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::new();
        if let Some(user_id) = filter.user_id.as_ref() {
            params.push(user_id);
            clauses.push(format!("user_id = ${}", params.len()));
        }
        if let Some(status) = status_text.as_ref() {
            params.push(status);
            clauses.push(format!("status = ${}", params.len()));
        }
        if let Some(exchange_id) = filter.exchange_id.as_ref() {
            params.push(exchange_id);
            clauses.push(format!("exchange_id = ${}", params.len()));
        }
        if let Some(is_testnet) = filter.is_testnet.as_ref() {
            params.push(is_testnet);
            clauses.push(format!("is_testnet = ${}", params.len()));
        }
        if let Some(symbol) = filter.symbol.as_ref() {
            params.push(symbol);
            clauses.push(format!("symbol = ${}", params.len()));
        }
        let mut sql = format!("SELECT {ORDER_COLUMNS} FROM orders");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at DESC");
        let rows = client
            .query(&sql, &params)
            .map_err(|err| Error::new(format!("list orders failed: {err}")))?;
        rows.iter().map(row_to_order).collect()
    }

    fn atomic_transition(
        &self,
        id: i64,
        expected: &[OrderStatus],
        changes: OrderChanges,
    ) -> Result<Option<Order>> {
        let mut client = self.connect()?;
        run_transition(&mut client, self.now(), id, expected, &changes)
    }

    fn patch(&self, id: i64, patch: OrderPatch) -> Result<Option<Order>> {
        let mut client = self.connect()?;
        let now = self.now();
        let sql = format!(
            "UPDATE orders SET \
             entry_price = COALESCE($2, entry_price), \
             max_entry = COALESCE($3, max_entry), \
             take_profit = CASE WHEN $4 THEN $5 ELSE take_profit END, \
             stop_loss = CASE WHEN $6 THEN $7 ELSE stop_loss END, \
             entry_interval = COALESCE($8, entry_interval), \
             stop_interval = COALESCE($9, stop_interval), \
             sl_updated_at = COALESCE($10, sl_updated_at), \
             updated_at = $11 \
             WHERE id = $1 AND status IN ('PENDING', 'EXECUTED') \
             RETURNING {ORDER_COLUMNS}"
        );
        let row = client
            .query_opt(
                &sql,
                &[
                    &id,
                    &patch.entry_price,
                    &patch.max_entry,
                    &patch.take_profit.is_some(),
                    &patch.take_profit.flatten(),
                    &patch.stop_loss.is_some(),
                    &patch.stop_loss.flatten(),
                    &patch.entry_interval.map(Interval::as_str),
                    &patch.stop_interval.map(Interval::as_str),
                    &patch.sl_updated_at,
                    &now,
                ],
            )
            .map_err(|err| Error::new(format!("patch order failed: {err}")))?;
        row.map(|row| row_to_order(&row)).transpose()
    }

    fn split(
        &self,
        id: i64,
        expected: OrderStatus,
        original: OrderChanges,
        sibling: NewOrder,
    ) -> Result<Option<(Order, Order)>> {
        let mut client = self.connect()?;
        let now = self.now();
        let mut tx = client
            .transaction()
            .map_err(|err| Error::new(format!("db transaction failed: {err}")))?;
        let updated = match run_transition(&mut tx, now, id, &[expected], &original)? {
            Some(order) => order,
            None => return Ok(None),
        };
        let sql = format!(
            "INSERT INTO orders (user_id, exchange_id, api_key_id, is_testnet, symbol, side, \
             quantity, status, entry_price, max_entry, take_profit, stop_loss, entry_interval, \
             stop_interval, executed_price, executed_at, tp_order_id, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, \
             $18, $19) RETURNING {ORDER_COLUMNS}"
        );
        let row = tx
            .query_one(
                &sql,
                &[
                    &sibling.user_id,
                    &sibling.exchange_id,
                    &sibling.api_key_id,
                    &sibling.is_testnet,
                    &sibling.symbol,
                    &sibling.side.as_str(),
                    &sibling.quantity,
                    &sibling.status.as_str(),
                    &sibling.entry_price,
                    &sibling.max_entry,
                    &sibling.take_profit,
                    &sibling.stop_loss,
                    &sibling.entry_interval.as_str(),
                    &sibling.stop_interval.as_str(),
                    &sibling.executed_price,
                    &sibling.executed_at,
                    &sibling.tp_order_id,
                    &now,
                    &now,
                ],
            )
            .map_err(|err| Error::new(format!("insert split order failed: {err}")))?;
        let inserted = row_to_order(&row)?;
        tx.commit()
            .map_err(|err| Error::new(format!("db commit failed: {err}")))?;
        Ok(Some((updated, inserted)))
    }

    fn list_exchanges(&self) -> Result<Vec<ExchangeRef>> {
        let mut client = self.connect()?;
        let rows = client
            .query("SELECT id, name FROM exchanges ORDER BY id", &[])
            .map_err(|err| Error::new(format!("list exchanges failed: {err}")))?;
        let mut result = Vec::with_capacity(rows.len());
        for row in rows {
            result.push(ExchangeRef {
                id: row
                    .try_get("id")
                    .map_err(|err| Error::new(format!("exchange id column: {err}")))?,
                name: row
                    .try_get("name")
                    .map_err(|err| Error::new(format!("exchange name column: {err}")))?,
            });
        }
        Ok(result)
    }
}

fn run_transition<C: GenericClient>(
    client: &mut C,
    now: DateTime<Utc>,
    id: i64,
    expected: &[OrderStatus],
    changes: &OrderChanges,
) -> Result<Option<Order>> {
    let expected_text: Vec<String> = expected
        .iter()
        .map(|status| status.as_str().to_string())
        .collect();
    let sql = format!(
        "UPDATE orders SET \
         status = $2, \
         quantity = COALESCE($3, quantity), \
         entry_price = COALESCE($4, entry_price), \
         max_entry = COALESCE($5, max_entry), \
         take_profit = CASE WHEN $6 THEN $7 ELSE take_profit END, \
         stop_loss = CASE WHEN $8 THEN $9 ELSE stop_loss END, \
         entry_interval = COALESCE($10, entry_interval), \
         stop_interval = COALESCE($11, stop_interval), \
         executed_price = COALESCE($12, executed_price), \
         executed_at = COALESCE($13, executed_at), \
         closed_at = COALESCE($14, closed_at), \
         sl_updated_at = COALESCE($15, sl_updated_at), \
         tp_order_id = CASE WHEN $16 THEN $17 ELSE tp_order_id END, \
         updated_at = $18 \
         WHERE id = $1 AND status = ANY($19) \
         RETURNING {ORDER_COLUMNS}"
    );
    let row = client
        .query_opt(
            &sql,
            &[
                &id,
                &changes.status.as_str(),
                &changes.quantity,
                &changes.entry_price,
                &changes.max_entry,
                &changes.take_profit.is_some(),
                &changes.take_profit.flatten(),
                &changes.stop_loss.is_some(),
                &changes.stop_loss.flatten(),
                &changes.entry_interval.map(Interval::as_str),
                &changes.stop_interval.map(Interval::as_str),
                &changes.executed_price,
                &changes.executed_at,
                &changes.closed_at,
                &changes.sl_updated_at,
                &changes.tp_order_id.is_some(),
                &changes.tp_order_id.clone().flatten(),
                &now,
                &expected_text,
            ],
        )
        .map_err(|err| Error::new(format!("order transition failed: {err}")))?;
    row.map(|row| row_to_order(&row)).transpose()
}

fn row_to_order(row: &Row) -> Result<Order> {
    let side: String = get(row, "side")?;
    let status: String = get(row, "status")?;
    let entry_interval: String = get(row, "entry_interval")?;
    let stop_interval: String = get(row, "stop_interval")?;
    Ok(Order {
        id: get(row, "id")?,
        user_id: get(row, "user_id")?,
        exchange_id: get(row, "exchange_id")?,
        api_key_id: get(row, "api_key_id")?,
        is_testnet: get(row, "is_testnet")?,
        symbol: get(row, "symbol")?,
        side: Side::parse(&side)?,
        quantity: get::<Decimal>(row, "quantity")?,
        status: OrderStatus::parse(&status)?,
        entry_price: get(row, "entry_price")?,
        max_entry: get(row, "max_entry")?,
        take_profit: get(row, "take_profit")?,
        stop_loss: get(row, "stop_loss")?,
        entry_interval: Interval::parse(&entry_interval)?,
        stop_interval: Interval::parse(&stop_interval)?,
        executed_price: get(row, "executed_price")?,
        executed_at: get(row, "executed_at")?,
        closed_at: get(row, "closed_at")?,
        sl_updated_at: get(row, "sl_updated_at")?,
        tp_order_id: get(row, "tp_order_id")?,
        created_at: get(row, "created_at")?,
        updated_at: get(row, "updated_at")?,
    })
}

fn get<'a, T: postgres::types::FromSql<'a>>(row: &'a Row, column: &str) -> Result<T> {
    row.try_get(column)
        .map_err(|err| Error::new(format!("column {column}: {err}")))
}

fn split_statements(sql: &str) -> Vec<String> {
    let mut cleaned = String::new();
    for line in sql.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("--") {
            continue;
        }
        cleaned.push_str(line);
        cleaned.push('\n');
    }
    cleaned
        .split(';')
        .map(|statement| statement.trim().to_string())
        .filter(|statement| !statement.is_empty())
        .collect()
}

/// The core never decrypts anything itself; the hosting application plugs
/// its decryption in here. Passthrough covers deployments that store keys
/// in the clear (testnets, local runs).
pub trait Decryptor: Send + Sync {
    fn decrypt(&self, user_id: i64, ciphertext: &str) -> Result<String>;
}

pub struct PassthroughDecryptor;

impl Decryptor for PassthroughDecryptor {
    fn decrypt(&self, _user_id: i64, ciphertext: &str) -> Result<String> {
        Ok(ciphertext.to_string())
    }
}

pub struct PostgresCredentialSource {
    dsn: String,
    decryptor: Arc<dyn Decryptor>,
}

impl PostgresCredentialSource {
    pub fn new(dsn: impl Into<String>, decryptor: Arc<dyn Decryptor>) -> Self {
        Self {
            dsn: dsn.into(),
            decryptor,
        }
    }

    fn connect(&self) -> Result<Client> {
        Client::connect(&self.dsn, NoTls)
            .map_err(|err| Error::new(format!("postgres connect failed: {err}")))
    }
}

impl CredentialSource for PostgresCredentialSource {
    fn credentials(
        &self,
        user_id: i64,
        exchange_id: i32,
        is_testnet: bool,
    ) -> Result<ApiCredentials> {
        let mut client = self.connect()?;
        let row = client
            .query_opt(
                "SELECT id, api_key_ct, secret_key_ct FROM api_keys \
                 WHERE user_id = $1 AND exchange_id = $2 AND is_testnet = $3 \
                 ORDER BY created_at DESC LIMIT 1",
                &[&user_id, &exchange_id, &is_testnet],
            )
            .map_err(|err| Error::new(format!("load api key failed: {err}")))?
            .ok_or_else(|| {
                Error::new(format!(
                    "no api key for user {user_id} exchange {exchange_id} testnet {is_testnet}"
                ))
            })?;
        let api_key_id: i64 = row
            .try_get("id")
            .map_err(|err| Error::new(format!("api key id column: {err}")))?;
        let api_key_ct: String = row
            .try_get("api_key_ct")
            .map_err(|err| Error::new(format!("api key column: {err}")))?;
        let secret_key_ct: String = row
            .try_get("secret_key_ct")
            .map_err(|err| Error::new(format!("secret key column: {err}")))?;
        Ok(ApiCredentials {
            api_key_id,
            api_key: self.decryptor.decrypt(user_id, &api_key_ct)?,
            api_secret: self.decryptor.decrypt(user_id, &secret_key_ct)?,
        })
    }
}
