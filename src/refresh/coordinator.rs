//! Single-flight token refresh.
//!
//! A burst of requests failing with 401 at the same moment must cost one
//! call to the refresh endpoint. The first caller that finds no exchange in
//! flight starts one and publishes it as a [`Shared`] future; everyone else
//! awaits the published future and therefore observes the very same
//! outcome. The exchange clears its own slot when it settles, so the next
//! failure after that starts a new cycle.

use crate::error::RefreshFailure;
use crate::redact::redact_secrets;
use crate::state::TokenStore;
use crate::types::TokenPair;
use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Performs the network half of a refresh: trades a refresh token for a new pair.
#[async_trait]
pub trait TokenExchanger: Send + Sync {
    async fn exchange(&self, refresh_token: &str) -> Result<TokenPair, RefreshFailure>;
}

pub type RefreshOutcome = Result<TokenPair, RefreshFailure>;

type ExchangeFuture = Shared<BoxFuture<'static, RefreshOutcome>>;

struct InFlight {
    cycle: u64,
    exchange: ExchangeFuture,
}

#[derive(Clone)]
pub struct RefreshCoordinator {
    tokens: TokenStore,
    exchanger: Arc<dyn TokenExchanger>,
    in_flight: Arc<Mutex<Option<InFlight>>>,
    cycles: Arc<AtomicU64>,
}

impl RefreshCoordinator {
    pub fn new(tokens: TokenStore, exchanger: Arc<dyn TokenExchanger>) -> Self {
        Self {
            tokens,
            exchanger,
            in_flight: Arc::new(Mutex::new(None)),
            cycles: Arc::new(AtomicU64::new(0)),
        }
    }

    pub async fn is_refreshing(&self) -> bool {
        self.in_flight.lock().await.is_some()
    }

    /// Number of exchange cycles started so far.
    pub fn cycles_started(&self) -> u64 {
        self.cycles.load(Ordering::SeqCst)
    }

    /// Joins the exchange in flight, or starts one when there is none.
    pub async fn refresh(&self) -> RefreshOutcome {
        let exchange = {
            let mut slot = self.in_flight.lock().await;
            match slot.as_ref() {
                Some(current) => {
                    debug!(cycle = current.cycle, "joining in-flight token refresh");
                    current.exchange.clone()
                }
                None => {
                    let cycle = self.cycles.fetch_add(1, Ordering::SeqCst) + 1;
                    let exchange = self.start_cycle(cycle).boxed().shared();
                    *slot = Some(InFlight {
                        cycle,
                        exchange: exchange.clone(),
                    });
                    exchange
                }
            }
        };

        exchange.await
    }

    fn start_cycle(
        &self,
        cycle: u64,
    ) -> impl std::future::Future<Output = RefreshOutcome> + Send + 'static {
        let tokens = self.tokens.clone();
        let exchanger = self.exchanger.clone();
        let in_flight = self.in_flight.clone();

        async move {
            info!(cycle, "token refresh started");
            let outcome = run_exchange(&tokens, exchanger.as_ref()).await;

            match &outcome {
                Ok(_) => info!(cycle, "token refresh succeeded"),
                Err(failure) => warn!(cycle, error = %failure, "token refresh failed"),
            }

            let mut slot = in_flight.lock().await;
            if slot.as_ref().is_some_and(|current| current.cycle == cycle) {
                *slot = None;
            }
            outcome
        }
    }
}

async fn run_exchange(tokens: &TokenStore, exchanger: &dyn TokenExchanger) -> RefreshOutcome {
    // A clear (logout) while the exchange is in flight bumps this; the new
    // pair must then be dropped rather than written back.
    let generation = tokens.generation().await;

    let refresh_token = match tokens.refresh_token().await {
        Ok(Some(token)) => token,
        Ok(None) => {
            clear_tokens(tokens, generation).await;
            return Err(RefreshFailure::MissingRefreshToken);
        }
        Err(e) => {
            clear_tokens(tokens, generation).await;
            return Err(RefreshFailure::Exchange(e.to_string()));
        }
    };

    match exchanger.exchange(&refresh_token).await {
        Ok(pair) => match tokens.set_if_generation(&pair, generation).await {
            Ok(true) => Ok(pair),
            Ok(false) => {
                info!("session ended during token refresh; discarding new tokens");
                Err(RefreshFailure::SessionEnded)
            }
            Err(e) => {
                // The in-memory copy is already updated even if persisting fails.
                warn!(error = %redact_secrets(&e.to_string()), "failed to persist refreshed tokens");
                Ok(pair)
            }
        },
        Err(failure) => {
            clear_tokens(tokens, generation).await;
            Err(failure)
        }
    }
}

async fn clear_tokens(tokens: &TokenStore, generation: u64) {
    if let Err(e) = tokens.clear_if_generation(generation).await {
        warn!(error = %e, "failed to clear tokens after refresh failure");
    }
}
