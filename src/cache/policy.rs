//! Decides which network responses are written to the cache.

use reqwest::StatusCode;

/// Filter applied to successful network responses before they are stored.
///
/// Error statuses are ordinary responses here: with [`Eligibility::All`] a 404
/// or 500 is cached just like a 200.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Eligibility {
  /// Cache every response
  #[default]
  All,
  /// Cache only responses with exactly this status
  OnlyStatus(StatusCode),
}

impl Eligibility {
  /// Only cache responses with the given status code.
  pub fn only_status(code: u16) -> Result<Self, http::status::InvalidStatusCode> {
    StatusCode::from_u16(code).map(Self::OnlyStatus)
  }

  pub fn allows(&self, status: StatusCode) -> bool {
    match self {
      Self::All => true,
      Self::OnlyStatus(wanted) => *wanted == status,
    }
  }
}
