//! Exchange, queue and binding declarations.
//!
//! Declarations are idempotent: an identical redeclaration is a no-op, a
//! declaration that disagrees with what is stored is a topology error.

use crate::channel::{Address, DeadLetter};
use crate::error::{Error, Result};

/// pgmq limits queue names to identifier characters and 47 bytes.
const MAX_PGMQ_NAME: usize = 47;

/// A declared queue as stored in `routeslip_queues`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: Address,
    pub pgmq_name: String,
    pub durable: bool,
    pub dead_letter: Option<DeadLetter>,
}

/// Map an address onto a pgmq queue name.
pub fn pgmq_name(address: &Address) -> Result<String> {
    let name: String = address
        .as_str()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    if name.is_empty() || name.len() > MAX_PGMQ_NAME {
        return Err(Error::Topology(format!(
            "address {address:?} cannot be stored as a pgmq queue (1..={MAX_PGMQ_NAME} chars)"
        )));
    }
    Ok(name)
}

impl super::Db {
    /// Declare a direct exchange.
    pub async fn declare_exchange(&self, name: &str, durable: bool) -> Result<()> {
        sqlx::query(
            "INSERT INTO routeslip_exchanges (name, kind, durable) VALUES ($1, 'direct', $2)
             ON CONFLICT (name) DO NOTHING",
        )
        .bind(name)
        .bind(durable)
        .execute(self.pool())
        .await?;

        let (kind, stored_durable): (String, bool) =
            sqlx::query_as("SELECT kind, durable FROM routeslip_exchanges WHERE name = $1")
                .bind(name)
                .fetch_one(self.pool())
                .await?;

        if kind != "direct" || stored_durable != durable {
            return Err(Error::Topology(format!(
                "exchange {name} already declared as {kind} (durable={stored_durable})"
            )));
        }
        Ok(())
    }

    /// Declare a queue and its backing pgmq queue.
    pub async fn declare_queue(
        &self,
        name: &Address,
        durable: bool,
        dead_letter: Option<&DeadLetter>,
    ) -> Result<QueueInfo> {
        let pgmq_name = pgmq_name(name)?;
        let (dlx, dlrk) = match dead_letter {
            Some(dl) => (Some(dl.exchange.as_str()), Some(dl.routing_key.as_str())),
            None => (None, None),
        };

        // A conflict on either the name or the pgmq name leaves the row
        // untouched; the read-back below tells the two apart.
        sqlx::query(
            "INSERT INTO routeslip_queues
                (name, pgmq_name, durable, dead_letter_exchange, dead_letter_routing_key)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT DO NOTHING",
        )
        .bind(name.as_str())
        .bind(&pgmq_name)
        .bind(durable)
        .bind(dlx)
        .bind(dlrk)
        .execute(self.pool())
        .await?;

        let stored = self.queue_info(name).await?.ok_or_else(|| {
            Error::Topology(format!(
                "queue {name} collides with another queue stored as pgmq queue {pgmq_name}"
            ))
        })?;

        if stored.durable != durable || stored.dead_letter.as_ref() != dead_letter {
            return Err(Error::Topology(format!(
                "queue {name} already declared with different arguments"
            )));
        }

        self.create_queue(&stored.pgmq_name).await?;
        Ok(stored)
    }

    /// Bind a queue to an exchange under a routing key.
    pub async fn bind_queue(&self, exchange: &str, routing_key: &Address, queue: &Address) -> Result<()> {
        sqlx::query(
            "INSERT INTO routeslip_bindings (exchange, routing_key, queue_name) VALUES ($1, $2, $3)
             ON CONFLICT DO NOTHING",
        )
        .bind(exchange)
        .bind(routing_key.as_str())
        .bind(queue.as_str())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Look up a declared queue.
    pub async fn queue_info(&self, name: &Address) -> Result<Option<QueueInfo>> {
        let row: Option<(String, bool, Option<String>, Option<String>)> = sqlx::query_as(
            "SELECT pgmq_name, durable, dead_letter_exchange, dead_letter_routing_key
             FROM routeslip_queues WHERE name = $1",
        )
        .bind(name.as_str())
        .fetch_optional(self.pool())
        .await?;

        Ok(row.map(|(pgmq_name, durable, dlx, dlrk)| QueueInfo {
            name: name.clone(),
            pgmq_name,
            durable,
            dead_letter: match (dlx, dlrk) {
                (Some(exchange), Some(routing_key)) => Some(DeadLetter {
                    exchange,
                    routing_key: Address::new(routing_key),
                }),
                _ => None,
            },
        }))
    }

    /// pgmq queues bound to `exchange` under `routing_key`.
    pub async fn route(&self, exchange: &str, routing_key: &Address) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT q.pgmq_name
             FROM routeslip_bindings b
             JOIN routeslip_queues q ON q.name = b.queue_name
             WHERE b.exchange = $1 AND b.routing_key = $2
             ORDER BY q.pgmq_name",
        )
        .bind(exchange)
        .bind(routing_key.as_str())
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dotted_addresses_become_identifiers() {
        let name = pgmq_name(&Address::new("invalid.Routing.Slip-Enricher")).unwrap();
        assert_eq!(name, "invalid_routing_slip_enricher");
    }

    #[test]
    fn overlong_addresses_are_refused() {
        let long = Address::new("a".repeat(48));
        assert!(matches!(pgmq_name(&long), Err(Error::Topology(_))));
        assert!(pgmq_name(&Address::new("")).is_err());
    }
}
