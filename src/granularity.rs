use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::EvalError;

/// Specificity of disclosed location information, ordered coarse to fine.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Country,
    City,
    Neighborhood,
    #[serde(alias = "exact location name")]
    ExactLocationName,
    #[serde(alias = "exact gps coordinates")]
    ExactGpsCoordinates,
}

impl Granularity {
    pub const ALL: [Granularity; 5] = [
        Self::Country,
        Self::City,
        Self::Neighborhood,
        Self::ExactLocationName,
        Self::ExactGpsCoordinates,
    ];

    pub fn index(self) -> usize {
        match self {
            Self::Country => 0,
            Self::City => 1,
            Self::Neighborhood => 2,
            Self::ExactLocationName => 3,
            Self::ExactGpsCoordinates => 4,
        }
    }

    /// Levels strictly coarser than `self`, coarsest first.
    pub fn previous(self) -> &'static [Granularity] {
        &Self::ALL[..self.index()]
    }

    /// `self` and every finer level.
    pub fn at_or_finer(self) -> &'static [Granularity] {
        &Self::ALL[self.index()..]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Country => "country",
            Self::City => "city",
            Self::Neighborhood => "neighborhood",
            Self::ExactLocationName => "exact_location_name",
            Self::ExactGpsCoordinates => "exact_gps_coordinates",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::Country => "Country",
            Self::City => "City",
            Self::Neighborhood => "Neighborhood",
            Self::ExactLocationName => "Exact Location Name",
            Self::ExactGpsCoordinates => "Exact GPS Coordinates",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = EvalError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase().replace(' ', "_");
        Self::ALL
            .into_iter()
            .find(|granularity| granularity.as_str() == normalized)
            .ok_or_else(|| EvalError::schema("granularity", format!("unknown granularity: {value}")))
    }
}

/// A small set of granularities, indexed by [`Granularity::index`].
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct GranularitySet([bool; 5]);

impl GranularitySet {
    pub fn insert(&mut self, granularity: Granularity) {
        self.0[granularity.index()] = true;
    }

    pub fn contains(&self, granularity: Granularity) -> bool {
        self.0[granularity.index()]
    }
}

impl FromIterator<Granularity> for GranularitySet {
    fn from_iter<I: IntoIterator<Item = Granularity>>(iter: I) -> Self {
        let mut set = Self::default();
        for granularity in iter {
            set.insert(granularity);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn previous_granularities_follow_declared_order() {
        assert!(Granularity::Country.previous().is_empty());
        assert_eq!(
            Granularity::Neighborhood.previous(),
            &[Granularity::Country, Granularity::City]
        );
        assert_eq!(Granularity::ExactGpsCoordinates.previous().len(), 4);
        assert!(Granularity::City < Granularity::ExactLocationName);
    }

    #[test]
    fn parses_canonical_and_legacy_spellings() {
        assert_eq!(
            "exact_location_name".parse::<Granularity>().unwrap(),
            Granularity::ExactLocationName
        );
        assert_eq!(
            "exact gps coordinates".parse::<Granularity>().unwrap(),
            Granularity::ExactGpsCoordinates
        );
        assert!("street".parse::<Granularity>().is_err());

        let legacy: Granularity = serde_json::from_str("\"exact location name\"").unwrap();
        assert_eq!(legacy, Granularity::ExactLocationName);
        assert_eq!(
            serde_json::to_string(&Granularity::ExactLocationName).unwrap(),
            "\"exact_location_name\""
        );
    }

    #[test]
    fn granularity_set_tracks_members() {
        let set: GranularitySet = [Granularity::City, Granularity::ExactGpsCoordinates]
            .into_iter()
            .collect();
        assert!(set.contains(Granularity::City));
        assert!(!set.contains(Granularity::Country));
        assert_eq!(GranularitySet::default(), GranularitySet([false; 5]));
    }
}
