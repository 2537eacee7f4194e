// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, ensure, Context};
use clap::Args;
use gatehouse::config::Config;
use gatehouse::connection::Connection;
use gatehouse::mux;
use gatehouse::peer::Echo;
use gatehouse::postern::message::{Message, Op, INVALID_HANDLE};
use log::{info, warn};

// Attempts before a full ring counts as a failure.
const RETRIES: usize = 100;

/// Run concurrent echo callers over a loopback connection
#[derive(Args, Debug)]
pub struct Options {
    /// Configuration file; the defaults apply without one
    #[clap(long, short)]
    config: Option<PathBuf>,

    /// Number of concurrent callers
    #[clap(long, default_value_t = 4)]
    callers: usize,

    /// Calls made by each caller
    #[clap(long, default_value_t = 16)]
    calls: usize,
}

fn call(conn: &Connection, payload: &[u8]) -> anyhow::Result<()> {
    for attempt in 0..RETRIES {
        let request = Message::request(Op::Echo, INVALID_HANDLE, payload)
            .map_err(gatehouse::Errno)?;

        match conn.call(request) {
            Ok(response) => {
                ensure!(
                    response.payload == payload,
                    "got {:?} back for {:?}",
                    String::from_utf8_lossy(&response.payload),
                    String::from_utf8_lossy(payload)
                );
                return Ok(());
            }
            Err(e) if e.is_retryable() => {
                warn!("attempt {attempt}: {e}");
                thread::sleep(Duration::from_millis(1 << attempt.min(6)));
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(mux::Error::RingFull.into())
}

impl Options {
    pub fn execute(self) -> anyhow::Result<()> {
        let config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };

        let conn = Connection::loopback(&config, Echo)?;
        let endpoint = conn.endpoint();
        info!("loopback connection {} -> {}", endpoint.local, endpoint.peer);

        let start = Instant::now();
        let failures = thread::scope(|s| {
            let callers = (0..self.callers)
                .map(|n| {
                    let conn = &conn;
                    let calls = self.calls;
                    thread::Builder::new()
                        .name(format!("caller-{n}"))
                        .spawn_scoped(s, move || -> anyhow::Result<()> {
                            for i in 0..calls {
                                call(conn, format!("caller {n} call {i}").as_bytes())
                                    .with_context(|| format!("caller {n}, call {i}"))?;
                            }
                            Ok(())
                        })
                })
                .collect::<Result<Vec<_>, _>>()?;

            let mut failures = 0;
            for caller in callers {
                match caller.join() {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        eprintln!("{e:#}");
                        failures += 1;
                    }
                    Err(_) => return Err(anyhow!("caller thread panicked")),
                }
            }
            anyhow::Ok(failures)
        })?;
        let elapsed = start.elapsed();

        let stats = conn.stats();
        println!(
            "{} callers x {} calls in {elapsed:?}",
            self.callers, self.calls
        );
        println!(
            "submitted {}, delivered {}, dropped {}, truncated {}, ring full {}",
            stats.submitted, stats.delivered, stats.dropped, stats.truncated, stats.full
        );

        conn.shutdown()?;

        if failures > 0 {
            bail!("{failures} of {} callers failed", self.callers);
        }
        Ok(())
    }
}
