//! Math helpers: listener/source geometry and distance attenuation.

pub use glam::DVec3;

/// Position plus orientation of the listener.
///
/// The orientation is six doubles: the at (facing) vector followed by the up
/// vector. The default faces positive y with positive z as up.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ListenerPose {
    pub position: [f64; 3],
    pub orientation: [f64; 6],
}

impl Default for ListenerPose {
    fn default() -> Self {
        Self {
            position: [0.0, 0.0, 0.0],
            orientation: [0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
        }
    }
}

impl ListenerPose {
    pub fn at(&self) -> DVec3 {
        DVec3::new(self.orientation[0], self.orientation[1], self.orientation[2])
    }

    pub fn up(&self) -> DVec3 {
        DVec3::new(self.orientation[3], self.orientation[4], self.orientation[5])
    }

    /// Converts a world-space point into (azimuth degrees, elevation degrees,
    /// distance) relative to this pose.
    ///
    /// Azimuth is clockwise from the at vector when viewed from above, in
    /// [0, 360). Elevation is in [-90, 90].
    pub fn spherical_to(&self, point: [f64; 3]) -> (f64, f64, f64) {
        let delta = DVec3::from(point) - DVec3::from(self.position);
        let distance = delta.length();
        if distance < 1e-9 {
            return (0.0, 0.0, 0.0);
        }

        let at = self.at().normalize_or_zero();
        let up = self.up().normalize_or_zero();
        let right = at.cross(up);
        let dir = delta / distance;

        let x = dir.dot(right);
        let y = dir.dot(at);
        let z = dir.dot(up).clamp(-1.0, 1.0);

        let azimuth = x.atan2(y).to_degrees().rem_euclid(360.0);
        let elevation = z.asin().to_degrees();
        (azimuth, elevation, distance)
    }
}

/// How gain falls off with distance for 3D sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DistanceModel {
    None,
    #[default]
    Linear,
    Exponential,
    Inverse,
}

impl DistanceModel {
    pub fn from_index(v: i32) -> Option<Self> {
        match v {
            0 => Some(Self::None),
            1 => Some(Self::Linear),
            2 => Some(Self::Exponential),
            3 => Some(Self::Inverse),
            _ => None,
        }
    }

    pub fn to_index(self) -> i32 {
        match self {
            Self::None => 0,
            Self::Linear => 1,
            Self::Exponential => 2,
            Self::Inverse => 3,
        }
    }
}

/// Distance attenuation parameters for one 3D source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DistanceParams {
    pub model: DistanceModel,
    pub distance_ref: f64,
    pub distance_max: f64,
    pub rolloff: f64,
    pub closeness_boost: f64,
    pub closeness_boost_distance: f64,
}

impl Default for DistanceParams {
    fn default() -> Self {
        Self {
            model: DistanceModel::default(),
            distance_ref: 1.0,
            distance_max: 50.0,
            rolloff: 1.0,
            closeness_boost: 0.0,
            closeness_boost_distance: 0.0,
        }
    }
}

/// The gain multiplier for a source at the given distance.
pub fn attenuation_for_distance(params: &DistanceParams, distance: f64) -> f64 {
    let d = distance.clamp(params.distance_ref, params.distance_max);
    let mut mul = match params.model {
        DistanceModel::None => 1.0,
        DistanceModel::Linear => {
            let denom = params.distance_max - params.distance_ref;
            if denom <= 0.0 {
                1.0
            } else {
                1.0 - params.rolloff * (d - params.distance_ref) / denom
            }
        }
        DistanceModel::Exponential => {
            if params.distance_ref <= 0.0 {
                0.0
            } else {
                (d / params.distance_ref).powf(-params.rolloff)
            }
        }
        DistanceModel::Inverse => {
            let denom = params.distance_ref + params.rolloff * (d - params.distance_ref);
            if denom <= 0.0 {
                0.0
            } else {
                params.distance_ref / denom
            }
        }
    };

    if distance < params.closeness_boost_distance {
        mul *= 10.0f64.powf(params.closeness_boost / 20.0);
    }
    mul.clamp(0.0, 1.0 + 10.0f64.powf(params.closeness_boost / 20.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spherical_dead_ahead() {
        let pose = ListenerPose::default();
        let (az, el, dist) = pose.spherical_to([0.0, 5.0, 0.0]);
        assert!(az.abs() < 1e-9);
        assert!(el.abs() < 1e-9);
        assert!((dist - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_spherical_right_is_90() {
        let pose = ListenerPose::default();
        let (az, _, _) = pose.spherical_to([1.0, 0.0, 0.0]);
        assert!((az - 90.0).abs() < 1e-6);
    }

    #[test]
    fn test_linear_attenuation_endpoints() {
        let params = DistanceParams::default();
        assert!((attenuation_for_distance(&params, 0.5) - 1.0).abs() < 1e-9);
        assert!(attenuation_for_distance(&params, 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_no_model_is_unity() {
        let params = DistanceParams {
            model: DistanceModel::None,
            ..Default::default()
        };
        assert_eq!(attenuation_for_distance(&params, 10.0), 1.0);
    }
}
