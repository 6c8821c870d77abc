use std::{fmt, str::FromStr};

use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MeterKind {
    #[default]
    Electricity,
    Water,
    Gas,
}

impl MeterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Electricity => "electricity",
            Self::Water => "water",
            Self::Gas => "gas",
        }
    }
}

impl fmt::Display for MeterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown meter kind '{0}'")]
pub struct UnknownMeterKind(pub String);

impl FromStr for MeterKind {
    type Err = UnknownMeterKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "electricity" => Ok(Self::Electricity),
            "water" => Ok(Self::Water),
            "gas" => Ok(Self::Gas),
            other => Err(UnknownMeterKind(other.to_string())),
        }
    }
}

/// A metering point owned by a user, scoped to a home label.
#[derive(Debug, Clone, PartialEq)]
pub struct Meter {
    pub id: String,
    pub owner_id: String,
    pub home_name: String,
    pub meter_name: String,
    pub kind: MeterKind,
    pub created_at: OffsetDateTime,
    pub updated_at: Option<OffsetDateTime>,
    pub is_active: bool,
}

impl Meter {
    pub fn new(
        id: impl Into<String>,
        owner_id: impl Into<String>,
        home_name: impl Into<String>,
        meter_name: impl Into<String>,
        kind: MeterKind,
        created_at: OffsetDateTime,
    ) -> Self {
        Self {
            id: id.into(),
            owner_id: owner_id.into(),
            home_name: home_name.into(),
            meter_name: meter_name.into(),
            kind,
            created_at,
            updated_at: None,
            is_active: true,
        }
    }

    /// Timestamp used when comparing freshness against another copy.
    pub fn last_modified(&self) -> OffsetDateTime {
        self.updated_at.unwrap_or(self.created_at)
    }

    pub fn label(&self) -> String {
        format!("{} / {}", self.home_name, self.meter_name)
    }
}

/// Mutable meter attributes; identity and creation time never change.
#[derive(Debug, Clone, PartialEq)]
pub struct MeterChanges {
    pub home_name: String,
    pub meter_name: String,
    pub kind: MeterKind,
    pub is_active: bool,
}

impl From<&Meter> for MeterChanges {
    fn from(m: &Meter) -> Self {
        Self {
            home_name: m.home_name.clone(),
            meter_name: m.meter_name.clone(),
            kind: m.kind,
            is_active: m.is_active,
        }
    }
}
