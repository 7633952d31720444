use std::fmt;

use serde::{Deserialize, Serialize};

/// The four real-time data kinds, each with its own entity store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DataKind {
    /// Situation exchange: disruption and deviation messages.
    #[serde(rename = "SX")]
    Situation,
    /// Estimated timetables: predicted arrivals/departures per journey.
    #[serde(rename = "ET")]
    EstimatedTimetable,
    /// Vehicle monitoring: vehicle positions and activity.
    #[serde(rename = "VM")]
    VehicleMonitoring,
    /// Production timetables: planned journeys for the operating day.
    #[serde(rename = "PT")]
    ProductionTimetable,
}

impl DataKind {
    /// All kinds in delivery order.
    pub const ALL: [Self; 4] = [
        Self::Situation,
        Self::VehicleMonitoring,
        Self::EstimatedTimetable,
        Self::ProductionTimetable,
    ];

    /// Short code used in configuration and logs.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Situation => "SX",
            Self::EstimatedTimetable => "ET",
            Self::VehicleMonitoring => "VM",
            Self::ProductionTimetable => "PT",
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}
