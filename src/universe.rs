// =============================================================================
// Universe Scorer — per-symbol opportunity score and bucket assignment
// =============================================================================
//
// Scores blend z-scored liquidity, volatility, velocity and spread with
// funding and event-heat kickers. Buckets split the scored list into the
// tiers served by `GET /universe`: `core` (score >= 0.5), `watch` (>= 0.0),
// `bench` (the rest).
// =============================================================================

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Blend weights, adjustable via `POST /metrics/push`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniverseWeights {
    pub liquidity: f64,
    pub volatility: f64,
    pub velocity: f64,
    pub spread: f64,
    pub funding: f64,
    pub event_heat: f64,
}

impl Default for UniverseWeights {
    fn default() -> Self {
        Self {
            liquidity: 0.25,
            volatility: 0.20,
            velocity: 0.25,
            spread: 0.10,
            funding: 0.05,
            event_heat: 0.15,
        }
    }
}

/// Raw per-symbol features the scorer consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolFeatures {
    pub symbol: String,
    pub quote_volume_1m_usd: f64,
    pub book_depth_usd: f64,
    pub spread_bps: f64,
    pub velocity: f64,
    pub atr_pct: f64,
    #[serde(default)]
    pub funding_rate_8h: f64,
    #[serde(default)]
    pub event_heat: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoredSymbol {
    pub symbol: String,
    pub score: f64,
    pub velocity: f64,
    pub event_heat: f64,
}

fn mean_std(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0).max(1.0);
    (mean, var.sqrt())
}

fn z(x: f64, mean: f64, std: f64) -> f64 {
    if std <= 1e-9 {
        0.0
    } else {
        (x - mean) / std
    }
}

/// Score every symbol against the cross-section.
pub fn score_symbols(features: &[SymbolFeatures], w: &UniverseWeights) -> HashMap<String, f64> {
    if features.is_empty() {
        return HashMap::new();
    }
    let vols: Vec<f64> = features.iter().map(|f| f.quote_volume_1m_usd).collect();
    let depths: Vec<f64> = features.iter().map(|f| f.book_depth_usd).collect();
    let spreads: Vec<f64> = features.iter().map(|f| f.spread_bps).collect();
    let atrs: Vec<f64> = features.iter().map(|f| f.atr_pct).collect();

    let (mvol, svol) = mean_std(&vols);
    let (mdep, sdep) = mean_std(&depths);
    let (mspr, sspr) = mean_std(&spreads);
    let (matr, satr) = mean_std(&atrs);

    features
        .iter()
        .map(|f| {
            let liq = 0.5 * z(f.quote_volume_1m_usd, mvol, svol) + 0.5 * z(f.book_depth_usd, mdep, sdep);
            let vol = z(f.atr_pct, matr, satr);
            let spr = -z(f.spread_bps, mspr, sspr);
            let mom = f.velocity * 2.0;
            let fund = if f.funding_rate_8h > 0.0 { 0.5 } else { 0.0 };
            let evt = f.event_heat * 2.0;
            let score = w.liquidity * liq
                + w.volatility * vol
                + w.velocity * mom
                + w.spread * spr
                + w.funding * fund
                + w.event_heat * evt;
            (f.symbol.clone(), score)
        })
        .collect()
}

/// Score and rank, keeping velocity/heat alongside for the API payload.
pub fn rank_symbols(features: &[SymbolFeatures], w: &UniverseWeights) -> Vec<ScoredSymbol> {
    let scores = score_symbols(features, w);
    let mut out: Vec<ScoredSymbol> = features
        .iter()
        .map(|f| ScoredSymbol {
            symbol: f.symbol.clone(),
            score: scores.get(&f.symbol).copied().unwrap_or(0.0),
            velocity: f.velocity,
            event_heat: f.event_heat,
        })
        .collect();
    out.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    out
}

/// Tiered view served by the control plane.
#[derive(Debug, Clone, Serialize, Default)]
pub struct UniverseBuckets {
    pub core: Vec<ScoredSymbol>,
    pub watch: Vec<ScoredSymbol>,
    pub bench: Vec<ScoredSymbol>,
}

pub fn bucketize(ranked: Vec<ScoredSymbol>) -> UniverseBuckets {
    let mut buckets = UniverseBuckets::default();
    for entry in ranked {
        if entry.score >= 0.5 {
            buckets.core.push(entry);
        } else if entry.score >= 0.0 {
            buckets.watch.push(entry);
        } else {
            buckets.bench.push(entry);
        }
    }
    buckets
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn feat(symbol: &str, vol: f64, depth: f64, spread: f64, velocity: f64, atr: f64) -> SymbolFeatures {
        SymbolFeatures {
            symbol: symbol.into(),
            quote_volume_1m_usd: vol,
            book_depth_usd: depth,
            spread_bps: spread,
            velocity,
            atr_pct: atr,
            funding_rate_8h: 0.0,
            event_heat: 0.0,
        }
    }

    #[test]
    fn liquid_fast_symbol_outranks_thin_slow_one() {
        let features = vec![
            feat("BTCUSDT", 5_000_000.0, 2_000_000.0, 2.0, 0.8, 0.012),
            feat("DOGEUSDT", 100_000.0, 50_000.0, 20.0, 0.0, 0.010),
            feat("ETHUSDT", 2_000_000.0, 900_000.0, 3.0, 0.3, 0.011),
        ];
        let ranked = rank_symbols(&features, &UniverseWeights::default());
        assert_eq!(ranked[0].symbol, "BTCUSDT");
        assert_eq!(ranked.last().unwrap().symbol, "DOGEUSDT");
    }

    #[test]
    fn empty_universe_scores_empty() {
        assert!(score_symbols(&[], &UniverseWeights::default()).is_empty());
    }

    #[test]
    fn degenerate_cross_section_zeroes_z_terms() {
        // Identical features: all z-scores 0 → score driven by velocity only.
        let features = vec![
            feat("AAAUSDT", 1000.0, 1000.0, 5.0, 0.5, 0.01),
            feat("BBBUSDT", 1000.0, 1000.0, 5.0, 0.0, 0.01),
        ];
        let scores = score_symbols(&features, &UniverseWeights::default());
        assert!(scores["AAAUSDT"] > scores["BBBUSDT"]);
        assert_eq!(scores["BBBUSDT"], 0.0);
    }

    #[test]
    fn bucketize_tiers_by_score() {
        let ranked = vec![
            ScoredSymbol { symbol: "A".into(), score: 1.2, velocity: 0.0, event_heat: 0.0 },
            ScoredSymbol { symbol: "B".into(), score: 0.2, velocity: 0.0, event_heat: 0.0 },
            ScoredSymbol { symbol: "C".into(), score: -0.4, velocity: 0.0, event_heat: 0.0 },
        ];
        let buckets = bucketize(ranked);
        assert_eq!(buckets.core.len(), 1);
        assert_eq!(buckets.watch.len(), 1);
        assert_eq!(buckets.bench.len(), 1);
    }
}
