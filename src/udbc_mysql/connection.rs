use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, Row as MyRow};
use std::collections::HashMap;

use crate::error::DbError;
use crate::udbc::connection::Connection;
use crate::udbc::value::Value;
use crate::udbc_mysql::value_codec::{from_mysql_value, to_mysql_value};

pub struct MysqlConnection {
    conn: Conn,
    in_transaction: bool,
}

impl MysqlConnection {
    pub fn new(conn: Conn) -> Self {
        Self {
            conn,
            in_transaction: false,
        }
    }

    fn map_row(row: MyRow) -> HashMap<String, Value> {
        let mut out = HashMap::new();
        let cols = row.columns_ref();
        for i in 0..row.len() {
            let v = row.as_ref(i).map(from_mysql_value).unwrap_or(Value::Null);
            let name = cols
                .get(i)
                .map(|c| c.name_str().to_string())
                .unwrap_or_else(|| i.to_string());
            out.insert(name, v);
        }
        out
    }

    fn params(args: &[Value]) -> mysql_async::Params {
        if args.is_empty() {
            mysql_async::Params::Empty
        } else {
            mysql_async::Params::Positional(args.iter().map(to_mysql_value).collect())
        }
    }
}

#[async_trait]
impl Connection for MysqlConnection {
    async fn query(
        &mut self,
        sql: &str,
        args: &[Value],
    ) -> Result<Vec<HashMap<String, Value>>, DbError> {
        let rows: Vec<MyRow> = self.conn.exec(sql, Self::params(args)).await?;
        Ok(rows.into_iter().map(Self::map_row).collect())
    }

    async fn execute(&mut self, sql: &str, args: &[Value]) -> Result<u64, DbError> {
        self.conn.exec_drop(sql, Self::params(args)).await?;
        Ok(self.conn.affected_rows())
    }

    async fn last_insert_id(&mut self) -> Result<u64, DbError> {
        Ok(self.conn.last_insert_id().unwrap_or(0))
    }

    async fn begin(&mut self) -> Result<(), DbError> {
        self.conn.query_drop("BEGIN").await?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), DbError> {
        self.conn.query_drop("COMMIT").await?;
        self.in_transaction = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), DbError> {
        self.conn.query_drop("ROLLBACK").await?;
        self.in_transaction = false;
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    async fn ping(&mut self) -> Result<(), DbError> {
        self.conn.ping().await?;
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<(), DbError> {
        self.conn.disconnect().await?;
        Ok(())
    }
}
