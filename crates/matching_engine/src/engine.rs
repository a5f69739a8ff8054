use verification_pipeline::VerificationStage;

use crate::types::*;

/// Whether a candidate may be scored at all
pub fn is_eligible(profile: &DriverProfile, constraints: &MatchConstraints) -> bool {
    if profile.verification_stage != VerificationStage::Approved {
        return false;
    }
    if profile
        .seat_capacity
        .is_some_and(|seats| seats < constraints.passenger_count)
    {
        return false;
    }
    if let Some(date) = constraints.date {
        if profile.blocked_dates.contains(&date) {
            return false;
        }
    }
    true
}

/// Raw score of one candidate, floored at zero, with its contributions
pub fn score(
    profile: &DriverProfile,
    constraints: &MatchConstraints,
    config: &MatchingConfig,
) -> (f64, Vec<String>) {
    let mut total = 0.0;
    let mut reasons = Vec::new();

    if let Some(language) = constraints.language.as_deref() {
        if profile.speaks(language) {
            total += config.language_bonus;
            reasons.push(format!("Speaks {}", language));
        }
    }

    if constraints.vehicle_type == Some(profile.vehicle_type) {
        total += config.vehicle_type_bonus;
        reasons.push(format!("Drives a {}", profile.vehicle_type.as_str()));
    }

    total += profile.rating * config.rating_weight;
    reasons.push(format!("Rated {:.1}", profile.rating));

    let experience = profile.experience_years.min(config.experience_cap);
    total += f64::from(experience);
    if experience > 0 {
        reasons.push(format!("{} years experience", profile.experience_years));
    }

    if profile.cancellation_rate > 0.0 {
        total -= profile.cancellation_rate * config.cancellation_penalty_weight;
        reasons.push(format!(
            "Cancels {:.0}% of trips",
            profile.cancellation_rate * 100.0
        ));
    }

    (total.max(0.0), reasons)
}

/// Ranks candidates against `constraints`.
///
/// Ineligible candidates are dropped before scoring. Scores are normalized by
/// the best raw score. Ties go to the lower cancellation rate, then to the
/// smaller driver id, so the order is deterministic.
pub fn rank(
    constraints: &MatchConstraints,
    candidates: &[DriverProfile],
    config: &MatchingConfig,
) -> Vec<RankedCandidate> {
    let mut scored: Vec<(&DriverProfile, f64, Vec<String>)> = candidates
        .iter()
        .filter(|profile| is_eligible(profile, constraints))
        .map(|profile| {
            let (raw, reasons) = score(profile, constraints, config);
            (profile, raw, reasons)
        })
        .collect();

    scored.sort_by(|(a, a_score, _), (b, b_score, _)| {
        b_score
            .total_cmp(a_score)
            .then_with(|| a.cancellation_rate.total_cmp(&b.cancellation_rate))
            .then_with(|| a.id.cmp(&b.id))
    });

    let best = scored.first().map(|(_, raw, _)| *raw).unwrap_or(0.0);
    scored
        .into_iter()
        .map(|(profile, raw, reasons)| RankedCandidate {
            driver_id: profile.id.clone(),
            score: if best > 0.0 { raw / best } else { 0.0 },
            reasons,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn driver(id: &str) -> DriverProfile {
        DriverProfile {
            id: id.to_string(),
            verification_stage: VerificationStage::Approved,
            risk_score: 10,
            rating: 4.5,
            experience_years: 5,
            languages: vec!["English".to_string()],
            vehicle_type: VehicleType::Sedan,
            cancellation_rate: 0.05,
            seat_capacity: Some(3),
            blocked_dates: Vec::new(),
        }
    }

    #[test]
    fn test_unapproved_drivers_are_never_returned() {
        let mut pending = driver("a");
        pending.verification_stage = VerificationStage::ManualReview;
        let mut rejected = driver("b");
        rejected.verification_stage = VerificationStage::Rejected;

        let ranked = rank(
            &MatchConstraints::default(),
            &[pending, rejected, driver("c")],
            &MatchingConfig::default(),
        );
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].driver_id, "c");
    }

    #[test]
    fn test_high_cancellation_rate_never_outranks_low() {
        let reliable = driver("z-reliable");
        let mut flaky = driver("a-flaky");
        flaky.cancellation_rate = 0.5;

        let ranked = rank(
            &MatchConstraints::default(),
            &[flaky, reliable],
            &MatchingConfig::default(),
        );
        assert_eq!(ranked[0].driver_id, "z-reliable");
        assert_eq!(ranked[0].score, 1.0);
        assert!(ranked[1].score < 1.0);
    }

    #[test]
    fn test_ties_break_on_driver_id() {
        let ranked = rank(
            &MatchConstraints::default(),
            &[driver("d3"), driver("d1"), driver("d2")],
            &MatchingConfig::default(),
        );
        let ids: Vec<&str> = ranked.iter().map(|c| c.driver_id.as_str()).collect();
        assert_eq!(ids, vec!["d1", "d2", "d3"]);
        assert!(ranked.iter().all(|c| c.score == 1.0));
    }

    #[test]
    fn test_ranking_is_deterministic() {
        let mut pool: Vec<DriverProfile> = (0..20u32)
            .map(|i| {
                let mut profile = driver(&format!("d{:02}", i));
                profile.rating = f64::from(i % 5);
                profile.cancellation_rate = f64::from(i % 3) / 10.0;
                profile
            })
            .collect();
        let constraints = MatchConstraints {
            language: Some("english".to_string()),
            ..MatchConstraints::default()
        };
        let config = MatchingConfig::default();

        let first = rank(&constraints, &pool, &config);
        pool.reverse();
        let second = rank(&constraints, &pool, &config);
        assert_eq!(first, second);
        assert!(first.windows(2).all(|pair| pair[0].score >= pair[1].score));
    }

    #[test]
    fn test_language_and_vehicle_bonuses() {
        let mut polyglot = driver("b");
        polyglot.languages.push("Hindi".to_string());
        polyglot.vehicle_type = VehicleType::Suv;

        let constraints = MatchConstraints {
            language: Some("hindi".to_string()),
            vehicle_type: Some(VehicleType::Suv),
            ..MatchConstraints::default()
        };
        let ranked = rank(
            &constraints,
            &[driver("a"), polyglot],
            &MatchingConfig::default(),
        );
        assert_eq!(ranked[0].driver_id, "b");
        assert!(ranked[0].reasons.iter().any(|r| r == "Speaks hindi"));
        assert!(ranked[0].reasons.iter().any(|r| r == "Drives a suv"));
    }

    #[test]
    fn test_scores_floor_at_zero() {
        let mut bad = driver("a");
        bad.rating = 0.0;
        bad.experience_years = 0;
        bad.cancellation_rate = 1.0;

        let (raw, _) = score(&bad, &MatchConstraints::default(), &MatchingConfig::default());
        assert_eq!(raw, 0.0);

        let ranked = rank(
            &MatchConstraints::default(),
            &[bad],
            &MatchingConfig::default(),
        );
        assert_eq!(ranked[0].score, 0.0);
    }

    #[test]
    fn test_capacity_and_blocked_dates_filter() {
        let date = NaiveDate::from_ymd_opt(2025, 12, 24).unwrap();
        let mut small = driver("small");
        small.seat_capacity = Some(3);
        let mut van = driver("van");
        van.seat_capacity = Some(8);
        let mut away = driver("away");
        away.seat_capacity = Some(8);
        away.blocked_dates.push(date);
        let mut unknown = driver("unknown");
        unknown.seat_capacity = None;

        let constraints = MatchConstraints {
            passenger_count: 6,
            date: Some(date),
            ..MatchConstraints::default()
        };
        let ranked = rank(
            &constraints,
            &[small, van, away, unknown],
            &MatchingConfig::default(),
        );
        let ids: Vec<&str> = ranked.iter().map(|c| c.driver_id.as_str()).collect();
        assert_eq!(ids, vec!["unknown", "van"]);
    }

    #[test]
    fn test_empty_pool() {
        assert!(rank(&MatchConstraints::default(), &[], &MatchingConfig::default()).is_empty());
    }
}
