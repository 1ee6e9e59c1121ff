//! bb8 connection manager for SQL Server.

use async_trait::async_trait;
use tiberius::{AuthMethod, Client, Config, EncryptionLevel};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

use crate::config::DataSourceConfig;

pub type MssqlClient = Client<Compat<TcpStream>>;
pub type MssqlPool = bb8::Pool<TiberiusConnectionManager>;

/// Opens tiberius clients for one data source.
///
/// Read-only managers set `ApplicationIntent=ReadOnly`, which routes to a
/// readable secondary where one exists and rejects writes.
#[derive(Clone)]
pub struct TiberiusConnectionManager {
    source: DataSourceConfig,
    read_only: bool,
}

impl TiberiusConnectionManager {
    pub fn new(source: DataSourceConfig, read_only: bool) -> Self {
        Self { source, read_only }
    }

    fn build_config(&self) -> Config {
        let mut config = Config::new();
        config.host(&self.source.host);
        config.port(self.source.get_port());
        config.database(&self.source.database);
        config.authentication(AuthMethod::sql_server(
            &self.source.user,
            &self.source.password,
        ));
        if self.source.encrypt {
            if self.source.trust_server_cert {
                config.trust_cert();
            }
            config.encryption(EncryptionLevel::Required);
        } else {
            config.encryption(EncryptionLevel::NotSupported);
        }
        config.readonly(self.read_only);
        config
    }

    /// Open a standalone connection outside any pool.
    pub async fn connect_once(&self) -> Result<MssqlClient, tiberius::error::Error> {
        let config = self.build_config();
        let tcp = TcpStream::connect(config.get_addr())
            .await
            .map_err(|e| tiberius::error::Error::Io {
                kind: e.kind(),
                message: e.to_string(),
            })?;
        tcp.set_nodelay(true).ok();
        Client::connect(config, tcp.compat_write()).await
    }
}

#[async_trait]
impl bb8::ManageConnection for TiberiusConnectionManager {
    type Connection = MssqlClient;
    type Error = tiberius::error::Error;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        self.connect_once().await
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.simple_query("SELECT 1").await?.into_row().await?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}
