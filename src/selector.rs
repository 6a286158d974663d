//! Weighted round-robin selection of backend endpoints.

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A backend server address with its share of placements.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub weight: u32,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, weight: u32) -> Self {
        Endpoint {
            host: host.into(),
            port,
            weight,
        }
    }

    /// `host:port`, suitable for `TcpStream::connect`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} (weight {})", self.host, self.port, self.weight)
    }
}

/// Parses `host:port` (weight 1) or `host:port:weight`.
impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || {
            Error::Configuration(format!(
                "invalid endpoint {s:?}, expected host:port[:weight]"
            ))
        };
        let parts: Vec<&str> = s.split(':').collect();
        let (host, port, weight) = match parts.as_slice() {
            [host, port] => (*host, *port, "1"),
            [host, port, weight] => (*host, *port, *weight),
            _ => return Err(bad()),
        };
        if host.is_empty() {
            return Err(bad());
        }
        let port = port.parse().map_err(|_| bad())?;
        let weight = weight.parse().map_err(|_| bad())?;
        Ok(Endpoint::new(host, port, weight))
    }
}

#[derive(Debug)]
struct SelectorState {
    index: usize,
    current_weight: u32,
}

/// Classic interleaved weighted round robin.
///
/// Over any `sum(weights)` consecutive calls to [`next`](Self::next), each
/// endpoint is returned exactly `weight` times.
#[derive(Debug)]
pub struct WeightedRoundRobin {
    endpoints: Vec<Endpoint>,
    max_weight: u32,
    state: Mutex<SelectorState>,
}

impl WeightedRoundRobin {
    pub fn new(endpoints: Vec<Endpoint>) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(Error::Configuration("endpoint list is empty".to_string()));
        }
        if let Some(bad) = endpoints.iter().find(|e| e.weight == 0) {
            return Err(Error::Configuration(format!(
                "endpoint {} has weight 0, weights must be positive",
                bad.address()
            )));
        }

        let max_weight = endpoints.iter().map(|e| e.weight).max().unwrap_or(1);
        let last = endpoints.len() - 1;
        Ok(WeightedRoundRobin {
            endpoints,
            max_weight,
            // The first call wraps to index 0 and resets the weight to max.
            state: Mutex::new(SelectorState {
                index: last,
                current_weight: 0,
            }),
        })
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// Length of one full selection cycle.
    pub fn cycle_len(&self) -> u64 {
        self.endpoints.iter().map(|e| e.weight as u64).sum()
    }

    /// Pick the next endpoint.
    pub fn next(&self) -> &Endpoint {
        // A poisoned lock only means another caller panicked mid-call; the
        // two fields are always left consistent, so keep going.
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        loop {
            state.index = (state.index + 1) % self.endpoints.len();
            if state.index == 0 {
                state.current_weight = state.current_weight.saturating_sub(1);
                if state.current_weight == 0 {
                    state.current_weight = self.max_weight;
                }
            }

            let candidate = &self.endpoints[state.index];
            if candidate.weight >= state.current_weight {
                return candidate;
            }
        }
    }
}
