//! Supply/demand zone generation from confirmed pivots.

use crate::domain::analysis::{Pivot, SupplyDemandZone, ZoneSettings, ZoneType};

/// One zone per non-preview pivot: swing high ⇒ SUPPLY, swing low ⇒
/// DEMAND. Only the most recent `max_zones` survive.
pub fn generate_zones(pivots: &[Pivot], settings: &ZoneSettings) -> Vec<SupplyDemandZone> {
    let mut zones: Vec<SupplyDemandZone> = pivots
        .iter()
        .filter(|p| !p.is_preview)
        .map(|pivot| {
            let zone_type = if pivot.is_high {
                ZoneType::Supply
            } else {
                ZoneType::Demand
            };
            let center = pivot.actual_price;
            let half = (center * settings.thickness_pct / 100.0) / 2.0;

            SupplyDemandZone {
                zone_type,
                center_price: center,
                top_price: center + half,
                bottom_price: center - half,
                start_bar: pivot.bar_index,
                end_bar: pivot.bar_index + settings.extension_bars,
            }
        })
        .collect();

    if settings.max_zones > 0 && zones.len() > settings.max_zones {
        zones.drain(..zones.len() - settings.max_zones);
    }

    zones
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pivot(price: f64, bar_index: usize, is_high: bool) -> Pivot {
        Pivot {
            price,
            actual_price: price,
            bar_index,
            is_high,
            is_preview: false,
        }
    }

    #[test]
    fn test_zones_bracket_the_pivot() {
        let pivots = vec![
            pivot(100.0, 5, false),
            pivot(120.0, 10, true),
            pivot(95.0, 15, false),
        ];
        let zones = generate_zones(&pivots, &ZoneSettings::default());
        assert!(!zones.is_empty());
        for z in &zones {
            assert!(z.top_price >= z.center_price);
            assert!(z.center_price >= z.bottom_price);
        }
        assert_eq!(zones[1].zone_type, ZoneType::Supply);
        assert_eq!(zones[2].zone_type, ZoneType::Demand);
    }

    #[test]
    fn test_preview_pivots_skipped() {
        let mut p = pivot(100.0, 5, true);
        p.is_preview = true;
        assert!(generate_zones(&[p], &ZoneSettings::default()).is_empty());
    }

    #[test]
    fn test_max_zones_keeps_latest() {
        let pivots: Vec<Pivot> = (0..10)
            .map(|i| pivot(100.0 + i as f64 * 10.0, i * 5, i % 2 == 1))
            .collect();
        let settings = ZoneSettings {
            max_zones: 3,
            ..ZoneSettings::default()
        };
        let zones = generate_zones(&pivots, &settings);
        assert_eq!(zones.len(), 3);
        assert_eq!(zones[0].start_bar, 35);
    }
}
