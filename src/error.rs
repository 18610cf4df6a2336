use thiserror::Error;

use crate::models::ErrorType;

/// Failures raised while driving the remote site.
///
/// [`CrawlError::is_fatal`] is the one place that decides whether a
/// failure stops the crawl or gets written to the error ledger.
#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("authenticated session lost")]
    SessionLost,

    #[error("login failed after {0} attempts")]
    LoginExhausted(u32),

    #[error("captcha not solved after {0} attempts")]
    CaptchaExhausted(u32),

    #[error("browser driver failure: {0}")]
    Driver(String),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("failed to parse {0}")]
    Parse(String),

    #[error("failed to fetch {0}")]
    Fetch(String),

    #[error("order has no detail link")]
    NoDetailLink,

    #[error("no url: {0}")]
    NoUrl(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl CrawlError {
    /// Session loss, exhausted login/captcha budgets, driver failures and
    /// storage failures end the run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CrawlError::SessionLost
                | CrawlError::LoginExhausted(_)
                | CrawlError::CaptchaExhausted(_)
                | CrawlError::Driver(_)
                | CrawlError::Store(_)
        )
    }

    /// Ledger classification for a non-fatal failure.
    pub fn error_type(&self) -> ErrorType {
        match self {
            CrawlError::Timeout(_) => ErrorType::Timeout,
            CrawlError::Parse(_) => ErrorType::ParseError,
            CrawlError::NoDetailLink => ErrorType::NoDetailLink,
            CrawlError::NoUrl(_) => ErrorType::NoUrl,
            _ => ErrorType::FetchError,
        }
    }
}

impl From<sqlx::Error> for CrawlError {
    fn from(err: sqlx::Error) -> Self {
        CrawlError::Store(err.into())
    }
}

pub type CrawlResult<T> = std::result::Result<T, CrawlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_set_is_closed() {
        assert!(CrawlError::SessionLost.is_fatal());
        assert!(CrawlError::LoginExhausted(2).is_fatal());
        assert!(CrawlError::CaptchaExhausted(2).is_fatal());
        assert!(CrawlError::Driver("crashed".into()).is_fatal());
        assert!(CrawlError::Store(anyhow::anyhow!("disk full")).is_fatal());

        assert!(!CrawlError::Timeout("page".into()).is_fatal());
        assert!(!CrawlError::Parse("order".into()).is_fatal());
        assert!(!CrawlError::Fetch("order".into()).is_fatal());
        assert!(!CrawlError::NoDetailLink.is_fatal());
    }

    #[test]
    fn non_fatal_errors_map_to_ledger_types() {
        assert_eq!(CrawlError::Timeout("x".into()).error_type(), ErrorType::Timeout);
        assert_eq!(CrawlError::Parse("x".into()).error_type(), ErrorType::ParseError);
        assert_eq!(CrawlError::Fetch("x".into()).error_type(), ErrorType::FetchError);
        assert_eq!(CrawlError::NoUrl("x".into()).error_type(), ErrorType::NoUrl);
    }
}
