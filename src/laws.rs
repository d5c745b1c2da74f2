//! Reference tables for state-level antitakeover legislation.

/// Two-letter codes of the fifty states and the District of Columbia.
pub const US_STATES: [&str; 51] = [
    "AK", "AL", "AR", "AZ", "CA", "CO", "CT", "DC", "DE", "FL", "GA", "HI", "ID", "IL", "IN", "IA",
    "KS", "KY", "LA", "ME", "MD", "MA", "MI", "MN", "MS", "MO", "MT", "NE", "NV", "NH", "NJ", "NM",
    "NY", "NC", "ND", "OH", "OK", "OR", "PA", "RI", "SC", "SD", "TN", "TX", "UT", "VT", "VA", "WA",
    "WV", "WI", "WY",
];

/// First fiscal year in which a business combination law binds firms incorporated in
/// each adopting state.
pub const BUSINESS_COMBINATION_LAWS: [(&str, i64); 30] = [
    ("AZ", 1987),
    ("CT", 1989),
    ("DE", 1988),
    ("GA", 1988),
    ("ID", 1988),
    ("IL", 1989),
    ("IN", 1986),
    ("KS", 1989),
    ("KY", 1987),
    ("ME", 1988),
    ("MD", 1989),
    ("MA", 1989),
    ("MI", 1989),
    ("MN", 1987),
    ("MO", 1986),
    ("NE", 1988),
    ("NV", 1991),
    ("NJ", 1986),
    ("NY", 1985),
    ("OK", 1991),
    ("OH", 1990),
    ("PA", 1989),
    ("RI", 1990),
    ("SC", 1988),
    ("SD", 1990),
    ("TN", 1988),
    ("VA", 1988),
    ("WA", 1987),
    ("WI", 1987),
    ("WY", 1989),
];

pub fn is_us_state(code: &str) -> bool {
    US_STATES.contains(&code)
}

pub fn adoption_year(incorporation_state: &str) -> Option<i64> {
    BUSINESS_COMBINATION_LAWS
        .iter()
        .find(|(state, _)| *state == incorporation_state)
        .map(|(_, year)| *year)
}

/// 1 when a business combination law covers the state of incorporation in `fiscal_year`.
pub fn bc_law_in_force(incorporation_state: &str, fiscal_year: i64) -> i64 {
    match adoption_year(incorporation_state) {
        Some(year) if fiscal_year >= year => 1,
        _ => 0,
    }
}

/// Regulated utilities occupy SIC codes 4900 through 4999.
pub fn is_regulated_utility(sic: f64) -> bool {
    (4900.0..5000.0).contains(&sic)
}
