// 💱 Currency Profiles - Per-Currency Reporting Limits
// Static registry consulted by the validation engine (structuring thresholds)
// and by the spreadsheet normalizer (symbol voting).

use serde::{Deserialize, Serialize};

// ============================================================================
// CURRENCY PROFILE
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrencyProfile {
    /// ISO 4217 code
    pub code: String,

    /// Display name
    pub name: String,

    /// Symbols and codes that mark this currency in raw cell text
    pub symbols: Vec<String>,

    /// Regulatory cash-reporting limit. Same-day clusters sitting just
    /// below this value are the classic structuring signature.
    pub reporting_limit: f64,

    /// Fraction under the limit considered "near" (0.05 = within 5% below)
    pub near_margin: f64,
}

impl CurrencyProfile {
    /// Lower edge of the near-threshold band for this currency.
    pub fn near_band_floor(&self) -> f64 {
        self.reporting_limit * (1.0 - self.near_margin)
    }

    /// True when an amount sits inside [limit*(1-margin), limit).
    pub fn is_near_limit(&self, amount: f64) -> bool {
        let magnitude = amount.abs();
        magnitude >= self.near_band_floor() && magnitude < self.reporting_limit
    }
}

// ============================================================================
// CURRENCY REGISTRY
// ============================================================================

/// Static table of known currencies. Unknown codes fall back to a
/// 10,000-unit default profile.
pub struct CurrencyRegistry {
    profiles: Vec<CurrencyProfile>,
    default_profile: CurrencyProfile,
}

impl CurrencyRegistry {
    pub fn new() -> Self {
        let profiles = vec![
            profile("USD", "US Dollar", &["$", "USD", "US$"], 10_000.0),
            profile("EUR", "Euro", &["€", "EUR"], 10_000.0),
            profile("GBP", "Pound Sterling", &["£", "GBP"], 10_000.0),
            profile("INR", "Indian Rupee", &["₹", "INR", "Rs.", "Rs"], 50_000.0),
            profile("JPY", "Japanese Yen", &["¥", "JPY"], 1_000_000.0),
            profile("CAD", "Canadian Dollar", &["C$", "CAD"], 10_000.0),
            profile("AUD", "Australian Dollar", &["A$", "AUD"], 10_000.0),
        ];
        CurrencyRegistry {
            profiles,
            default_profile: profile("XXX", "Unknown Currency", &[], 10_000.0),
        }
    }

    pub fn get(&self, code: &str) -> Option<&CurrencyProfile> {
        let upper = code.trim().to_uppercase();
        self.profiles.iter().find(|p| p.code == upper)
    }

    /// Lookup with fallback: unknown or empty codes get the default profile.
    pub fn get_or_default(&self, code: &str) -> &CurrencyProfile {
        self.get(code).unwrap_or(&self.default_profile)
    }

    pub fn default_profile(&self) -> &CurrencyProfile {
        &self.default_profile
    }

    pub fn profile_count(&self) -> usize {
        self.profiles.len()
    }

    /// Vote a currency from raw cell text: count symbol/code occurrences per
    /// profile and return the code with the most hits. A bare "$" only votes
    /// for USD; C$/A$ are counted before their "$" substring can match.
    pub fn vote(&self, cells: &[String]) -> Option<String> {
        let mut best: Option<(&CurrencyProfile, usize)> = None;

        for p in &self.profiles {
            let mut hits = 0usize;
            for cell in cells {
                for sym in &p.symbols {
                    if sym == "$" {
                        // Count $ not preceded by a letter (skip C$/A$/US$)
                        hits += count_bare_dollar(cell);
                    } else {
                        hits += cell.matches(sym.as_str()).count();
                    }
                }
            }
            if hits > 0 {
                match best {
                    Some((_, best_hits)) if best_hits >= hits => {}
                    _ => best = Some((p, hits)),
                }
            }
        }

        best.map(|(p, _)| p.code.clone())
    }
}

impl Default for CurrencyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn profile(code: &str, name: &str, symbols: &[&str], limit: f64) -> CurrencyProfile {
    CurrencyProfile {
        code: code.to_string(),
        name: name.to_string(),
        symbols: symbols.iter().map(|s| s.to_string()).collect(),
        reporting_limit: limit,
        near_margin: 0.05,
    }
}

fn count_bare_dollar(cell: &str) -> usize {
    let bytes = cell.as_bytes();
    let mut count = 0;
    for (i, &b) in bytes.iter().enumerate() {
        if b == b'$' {
            let preceded_by_letter = i > 0 && bytes[i - 1].is_ascii_alphabetic();
            if !preceded_by_letter {
                count += 1;
            }
        }
    }
    count
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_known_and_unknown() {
        let registry = CurrencyRegistry::new();

        assert_eq!(registry.get("usd").unwrap().reporting_limit, 10_000.0);
        assert_eq!(registry.get("INR").unwrap().reporting_limit, 50_000.0);
        assert!(registry.get("ZZZ").is_none());

        // Fallback keeps validation running for unknown codes
        let fallback = registry.get_or_default("ZZZ");
        assert_eq!(fallback.code, "XXX");
        assert_eq!(fallback.reporting_limit, 10_000.0);
    }

    #[test]
    fn test_near_threshold_band() {
        let registry = CurrencyRegistry::new();
        let usd = registry.get("USD").unwrap();

        assert!(usd.is_near_limit(9_800.0)); // 2% below
        assert!(usd.is_near_limit(9_500.0)); // exactly at band floor
        assert!(!usd.is_near_limit(9_499.0)); // just outside
        assert!(!usd.is_near_limit(10_000.0)); // at limit = reportable, not "near"
        assert!(usd.is_near_limit(-9_900.0)); // sign-insensitive
    }

    #[test]
    fn test_symbol_voting() {
        let registry = CurrencyRegistry::new();

        let cells = vec![
            "₹1,200.00".to_string(),
            "Balance: ₹3,400".to_string(),
            "INR".to_string(),
        ];
        assert_eq!(registry.vote(&cells), Some("INR".to_string()));

        let cells = vec!["$100".to_string(), "$250.50".to_string()];
        assert_eq!(registry.vote(&cells), Some("USD".to_string()));

        // C$ must not be swallowed by the bare-$ rule
        let cells = vec!["C$90".to_string(), "C$45".to_string()];
        assert_eq!(registry.vote(&cells), Some("CAD".to_string()));

        let cells = vec!["no money here".to_string()];
        assert_eq!(registry.vote(&cells), None);
    }
}
