use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{Days, FixedOffset, NaiveDate, Utc};
use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info};

use tracer_common::{PartitionPrefix, TableCatalog};
use tracer_config::BootstrapConfig;

/// Pre-creates the day tables rows will be routed to.
///
/// Runs off the hot path: once before the consumer starts, then on a fixed
/// interval, each time covering `window_days` days starting today.
pub struct TableBootstrapper {
    catalog: Arc<dyn TableCatalog>,
    window_days: u32,
    run_interval: Duration,
    offset: FixedOffset,
}

impl TableBootstrapper {
    pub fn new(
        catalog: Arc<dyn TableCatalog>,
        config: &BootstrapConfig,
        offset: FixedOffset,
    ) -> Self {
        Self {
            catalog,
            window_days: config.window_days,
            run_interval: config.interval(),
            offset,
        }
    }

    /// Today in the partition offset.
    pub fn today(&self) -> NaiveDate {
        Utc::now().with_timezone(&self.offset).date_naive()
    }

    /// Creates both tables for every day of the window starting at `first_day`
    /// and returns the names touched, in creation order.
    pub async fn ensure_window(&self, first_day: NaiveDate) -> Result<Vec<String>> {
        let capacity = self.window_days as usize * PartitionPrefix::ALL.len();
        let mut created = Vec::with_capacity(capacity);

        for i in 0..self.window_days {
            let day = first_day
                .checked_add_days(Days::new(u64::from(i)))
                .ok_or_else(|| {
                    anyhow::anyhow!("Date overflow adding {} days to {}", i, first_day)
                })?;

            for prefix in PartitionPrefix::ALL {
                let table_name = prefix.table_for_date(day);
                match prefix {
                    PartitionPrefix::Trace => self.catalog.create_trace_table(&table_name).await?,
                    PartitionPrefix::ReverseIndex => {
                        self.catalog.create_reverse_index_table(&table_name).await?
                    }
                }
                debug!("Ensured table {}", table_name);
                created.push(table_name);
            }
        }

        info!(
            "Day tables ready for {} day(s) starting {}",
            self.window_days, first_day
        );
        Ok(created)
    }

    /// Re-runs [`ensure_window`](Self::ensure_window) every interval until shutdown.
    /// The first run is one interval out, after the startup bootstrap.
    /// Failures are logged and retried on the next tick.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            "Starting table bootstrap with run interval: {}s",
            self.run_interval.as_secs()
        );

        let mut ticker = interval_at(Instant::now() + self.run_interval, self.run_interval);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Table bootstrap stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.ensure_window(self.today()).await {
                        error!("Table bootstrap failed: {:#}", e);
                    }
                }
            }
        }
    }
}
