//! Proof-of-delivery checkpoint validation.
//!
//! Rules run in a fixed order; the first failure determines the error the
//! submitter sees. The route envelope is the union of tolerance-radius
//! discs around the pickup, the delivery, and interpolation samples
//! between them.

use logichain_crypto::{PublicKey, SignatureScheme};
use logichain_types::{
    ChainConfig, Checkpoint, Contract, CoreError, CoreResult, GeoPoint,
};

/// Validate `checkpoint` as the next link of `contract`'s chain.
///
/// `ingest_time` is the timestamp of the block carrying the checkpoint.
pub fn validate_checkpoint(
    contract: &Contract,
    checkpoint: &Checkpoint,
    ingest_time: f64,
    config: &ChainConfig,
) -> CoreResult<()> {
    // 1. Driver signature.
    let driver_key = PublicKey::from_bytes(SignatureScheme::Ed25519, &contract.driver_key)
        .map_err(|_| CoreError::InvalidSignature)?;
    checkpoint.verify_signature(&contract.id, &driver_key)?;

    // 2. Sequence continuity.
    let prev = contract.last_checkpoint();
    let expected_seq = prev.map(|cp| cp.seq + 1).unwrap_or(1);
    if checkpoint.seq != expected_seq {
        return Err(CoreError::CheckpointOutOfOrder);
    }

    // 3. Hash chain.
    let expected_prev = prev.map(|cp| cp.hash(&contract.id)).unwrap_or([0u8; 32]);
    if checkpoint.prev_hash != expected_prev {
        return Err(CoreError::CheckpointOutOfOrder);
    }

    // 4. Timestamp drift against block ingest time.
    if (checkpoint.timestamp - ingest_time).abs() > config.t_drift_secs {
        return Err(CoreError::TimestampDrift);
    }
    if let Some(prev) = prev {
        if checkpoint.timestamp <= prev.timestamp {
            return Err(CoreError::CheckpointOutOfOrder);
        }
    }

    // 5. Reported GPS accuracy.
    if !checkpoint.accuracy_m.is_finite()
        || checkpoint.accuracy_m <= 0.0
        || checkpoint.accuracy_m > config.gps_accuracy_limit_m
    {
        return Err(CoreError::CheckpointOutOfTolerance);
    }

    if !checkpoint.point.is_valid() {
        return Err(CoreError::CheckpointOutOfTolerance);
    }

    // 6. Step bound and speed plausibility from the prior checkpoint.
    if let Some(prev) = prev {
        let step_km = prev.point.haversine_km(&checkpoint.point);
        if step_km > config.max_step_km {
            return Err(CoreError::CheckpointOutOfTolerance);
        }
        let hours = (checkpoint.timestamp - prev.timestamp) / 3600.0;
        if hours > 0.0 && step_km / hours > config.max_speed_kmh {
            return Err(CoreError::CheckpointOutOfTolerance);
        }
    }

    // 7. Route envelope.
    if !within_envelope(
        &checkpoint.point,
        &contract.pickup,
        &contract.delivery,
        contract.tolerance_radius_m,
        config.max_step_km,
    ) {
        return Err(CoreError::CheckpointOutOfTolerance);
    }

    Ok(())
}

/// Whether `point` lies inside the planned-route envelope: within
/// `tolerance_m` of the pickup, the delivery, or an interpolated sample
/// between them.
///
/// Samples are spaced at most `sample_step_km` apart and never more than
/// half the tolerance radius, so consecutive discs overlap and a point on
/// the straight route always falls inside one of them.
pub fn within_envelope(
    point: &GeoPoint,
    pickup: &GeoPoint,
    delivery: &GeoPoint,
    tolerance_m: f64,
    sample_step_km: f64,
) -> bool {
    if tolerance_m <= 0.0 {
        return false;
    }
    let leg_m = pickup.haversine_m(delivery);
    let spacing_m = (sample_step_km * 1000.0).min(tolerance_m / 2.0).max(1.0);
    let samples = ((leg_m / spacing_m).ceil() as usize).max(1);

    for i in 0..=samples {
        let t = i as f64 / samples as f64;
        let sample = pickup.lerp(delivery, t);
        if sample.haversine_m(point) <= tolerance_m {
            return true;
        }
    }
    false
}

/// Whether the checkpoint lands inside the delivery disc, ending transit.
pub fn reaches_delivery(contract: &Contract, checkpoint: &Checkpoint) -> bool {
    checkpoint.point.haversine_m(&contract.delivery) <= contract.tolerance_radius_m
}

/// Whether the checkpoint lands inside the pickup disc, starting transit.
pub fn reaches_pickup(contract: &Contract, checkpoint: &Checkpoint) -> bool {
    checkpoint.point.haversine_m(&contract.pickup) <= contract.tolerance_radius_m
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_accepts_points_on_route() {
        let pickup = GeoPoint::new(-23.55, -46.63);
        let delivery = GeoPoint::new(-23.56, -46.64);
        let midway = pickup.lerp(&delivery, 0.5);
        assert!(within_envelope(&midway, &pickup, &delivery, 100.0, 5.0));
        assert!(within_envelope(&pickup, &pickup, &delivery, 100.0, 5.0));
        assert!(within_envelope(&delivery, &pickup, &delivery, 100.0, 5.0));
    }

    #[test]
    fn envelope_rejects_far_off_route() {
        let pickup = GeoPoint::new(-23.55, -46.63);
        let delivery = GeoPoint::new(-23.56, -46.64);
        // About 2 km east of the corridor.
        let off_route = GeoPoint::new(-23.555, -46.615);
        assert!(!within_envelope(&off_route, &pickup, &delivery, 100.0, 5.0));
    }

    #[test]
    fn envelope_samples_long_legs() {
        // A ~40 km leg: a point near the middle of the straight line must
        // still be inside the envelope thanks to interpolation samples.
        let pickup = GeoPoint::new(0.0, 0.0);
        let delivery = GeoPoint::new(0.0, 0.36);
        let midway = GeoPoint::new(0.0, 0.18);
        assert!(within_envelope(&midway, &pickup, &delivery, 500.0, 5.0));
    }
}
