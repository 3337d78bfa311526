//! CPU-bound demo handler: the naive recursive Fibonacci.

use crate::{Handler, HandlerError};

pub const DEFAULT_MAX_N: u32 = 45;

/// Largest `n` whose Fibonacci number fits in a `u64`.
pub const MAX_N: u32 = 93;

#[derive(Debug, Clone, Copy)]
pub struct Fibonacci {
    max_n: u32,
}

impl Fibonacci {
    /// Bounds above [`MAX_N`] are lowered to it.
    pub const fn new(max_n: u32) -> Self {
        let max_n = if max_n > MAX_N { MAX_N } else { max_n };
        Self { max_n }
    }
}

impl Default for Fibonacci {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_N)
    }
}

impl Handler for Fibonacci {
    fn handle(&self, request: &str) -> Result<String, HandlerError> {
        let request = request.trim();
        let n: u32 = request
            .parse()
            .map_err(|_| HandlerError::BadRequest(format!("expected a number, got {request:?}")))?;
        if n > self.max_n {
            return Err(HandlerError::BadRequest(format!(
                "n must be at most {}, got {n}",
                self.max_n
            )));
        }
        Ok(fib(n).to_string())
    }
}

/// Exponential on purpose: each request burns real CPU.
pub fn fib(n: u32) -> u64 {
    if n < 2 {
        u64::from(n)
    } else {
        fib(n - 1) + fib(n - 2)
    }
}
