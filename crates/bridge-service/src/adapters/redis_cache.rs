//! `ActionStateCache` backed by Redis, used for the short-lived data the
//! bridge does not need Postgres durability for: a pending direct
//! command per order id, and the action-status bag accumulated for the
//! order currently in flight.

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use bridge_shared::errors::{BridgeError, BridgeResult};
use bridge_shared::messaging::{ActionStateCache, ActionStatusWire};
use bridge_shared::models::PendingDirectCommand;

const PENDING_DIRECT_COMMAND_TTL_SECONDS: u64 = 300;
const ACTION_STATUS_TTL_SECONDS: u64 = 600;

pub struct RedisActionStateCache {
    conn: ConnectionManager,
}

impl RedisActionStateCache {
    pub async fn connect(redis_url: &str) -> BridgeResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| BridgeError::cache("connect", e))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| BridgeError::cache("connect", e))?;
        Ok(Self { conn })
    }

    fn pending_key(order_id: &str) -> String {
        format!("bridge:pending-direct-command:{order_id}")
    }

    fn action_status_key(order_id: &str) -> String {
        format!("bridge:action-statuses:{order_id}")
    }
}

#[async_trait]
impl ActionStateCache for RedisActionStateCache {
    async fn put_pending_direct_command(&self, cmd: &PendingDirectCommand) -> BridgeResult<()> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(cmd).map_err(|e| BridgeError::cache("encode", e))?;
        conn.set_ex::<_, _, ()>(
            Self::pending_key(&cmd.order_id),
            payload,
            PENDING_DIRECT_COMMAND_TTL_SECONDS,
        )
        .await
        .map_err(|e| BridgeError::cache("put_pending_direct_command", e))
    }

    async fn take_pending_direct_command(
        &self,
        order_id: &str,
    ) -> BridgeResult<Option<PendingDirectCommand>> {
        let mut conn = self.conn.clone();
        let key = Self::pending_key(order_id);
        let payload: Option<String> = conn
            .get(&key)
            .await
            .map_err(|e| BridgeError::cache("take_pending_direct_command", e))?;

        if let Some(payload) = &payload {
            let _: () = conn
                .del(&key)
                .await
                .map_err(|e| BridgeError::cache("take_pending_direct_command", e))?;
            let cmd = serde_json::from_str(payload).map_err(|e| BridgeError::cache("decode", e))?;
            Ok(Some(cmd))
        } else {
            Ok(None)
        }
    }

    async fn record_action_status(
        &self,
        order_id: &str,
        action_id: &str,
        status: ActionStatusWire,
    ) -> BridgeResult<()> {
        let mut conn = self.conn.clone();
        let key = Self::action_status_key(order_id);
        let value = serde_json::to_string(&status).map_err(|e| BridgeError::cache("encode", e))?;
        conn.hset::<_, _, _, ()>(&key, action_id, value)
            .await
            .map_err(|e| BridgeError::cache("record_action_status", e))?;
        conn.expire::<_, ()>(&key, ACTION_STATUS_TTL_SECONDS as i64)
            .await
            .map_err(|e| BridgeError::cache("record_action_status", e))
    }

    async fn action_statuses(
        &self,
        order_id: &str,
    ) -> BridgeResult<Vec<(String, ActionStatusWire)>> {
        let mut conn = self.conn.clone();
        let entries: Vec<(String, String)> = conn
            .hgetall(Self::action_status_key(order_id))
            .await
            .map_err(|e| BridgeError::cache("action_statuses", e))?;

        entries
            .into_iter()
            .map(|(action_id, raw)| {
                serde_json::from_str(&raw)
                    .map(|status| (action_id, status))
                    .map_err(|e| BridgeError::cache("decode", e))
            })
            .collect()
    }

    async fn clear_order(&self, order_id: &str) -> BridgeResult<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(Self::action_status_key(order_id))
            .await
            .map_err(|e| BridgeError::cache("clear_order", e))
    }
}
