use chrono::Utc;
use chrono_tz::Tz;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::str::FromStr;

use crate::error::{LeagueError, PersistenceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettingKey {
    CommissionRatePercent,
    PrizePoolSharePercent,
    DefaultGroup,
    DefaultLeverage,
    DefaultDepositCents,
    CompetitionTimezone,
}

impl SettingKey {
    pub const ALL: [Self; 6] = [
        Self::CommissionRatePercent,
        Self::PrizePoolSharePercent,
        Self::DefaultGroup,
        Self::DefaultLeverage,
        Self::DefaultDepositCents,
        Self::CompetitionTimezone,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CommissionRatePercent => "commission_rate_percent",
            Self::PrizePoolSharePercent => "prize_pool_share_percent",
            Self::DefaultGroup => "default_group",
            Self::DefaultLeverage => "default_leverage",
            Self::DefaultDepositCents => "default_deposit_cents",
            Self::CompetitionTimezone => "competition_timezone",
        }
    }

    pub const fn default_value(self) -> &'static str {
        match self {
            Self::CommissionRatePercent => "10",
            Self::PrizePoolSharePercent => "70",
            Self::DefaultGroup => "contest\\default",
            Self::DefaultLeverage => "100",
            Self::DefaultDepositCents => "1000000",
            Self::CompetitionTimezone => "UTC",
        }
    }

    fn validate(self, value: &str) -> Result<(), String> {
        match self {
            Self::CommissionRatePercent | Self::PrizePoolSharePercent => {
                parse_percent(value).map(|_| ())
            }
            Self::DefaultGroup => {
                if value.trim().is_empty() {
                    Err("group must not be empty".to_string())
                } else {
                    Ok(())
                }
            }
            Self::DefaultLeverage => match value.parse::<u32>() {
                Ok(leverage) if (1..=1000).contains(&leverage) => Ok(()),
                _ => Err(format!("leverage must be between 1 and 1000, got {value}")),
            },
            Self::DefaultDepositCents => match value.parse::<i64>() {
                Ok(cents) if cents > 0 => Ok(()),
                _ => Err(format!("deposit must be a positive number of cents, got {value}")),
            },
            Self::CompetitionTimezone => value
                .parse::<Tz>()
                .map(|_| ())
                .map_err(|_| format!("unknown timezone {value}")),
        }
    }
}

impl std::fmt::Display for SettingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SettingKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|key| key.as_str() == s)
            .ok_or_else(|| format!("Unknown setting: {s}"))
    }
}

fn parse_percent(value: &str) -> Result<Decimal, String> {
    let percent =
        Decimal::from_str(value.trim()).map_err(|_| format!("{value} is not a number"))?;

    if percent < Decimal::ZERO || percent > Decimal::ONE_HUNDRED {
        return Err(format!("percentage must be between 0 and 100, got {value}"));
    }

    Ok(percent)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Setting {
    pub key: SettingKey,
    pub value: String,
    pub is_default: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountDefaults {
    pub group: String,
    pub leverage: u32,
    pub deposit_cents: i64,
}

pub async fn get_setting(pool: &SqlitePool, key: SettingKey) -> Result<String, PersistenceError> {
    let stored: Option<String> = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?1")
        .bind(key.as_str())
        .fetch_optional(pool)
        .await?;

    Ok(stored.unwrap_or_else(|| key.default_value().to_string()))
}

pub async fn set_setting(
    pool: &SqlitePool,
    key: SettingKey,
    value: &str,
) -> Result<(), LeagueError> {
    key.validate(value)
        .map_err(|reason| LeagueError::Validation(format!("{key}: {reason}")))?;

    sqlx::query(
        r#"
        INSERT INTO settings (key, value, updated_at)
        VALUES (?1, ?2, ?3)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
        "#,
    )
    .bind(key.as_str())
    .bind(value.trim())
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn list_settings(pool: &SqlitePool) -> Result<Vec<Setting>, PersistenceError> {
    let stored: Vec<(String, String)> = sqlx::query_as("SELECT key, value FROM settings")
        .fetch_all(pool)
        .await?;

    Ok(SettingKey::ALL
        .into_iter()
        .map(|key| {
            stored
                .iter()
                .find(|(stored_key, _)| stored_key == key.as_str())
                .map_or_else(
                    || Setting {
                        key,
                        value: key.default_value().to_string(),
                        is_default: true,
                    },
                    |(_, value)| Setting {
                        key,
                        value: value.clone(),
                        is_default: false,
                    },
                )
        })
        .collect())
}

async fn get_percent(pool: &SqlitePool, key: SettingKey) -> Result<Decimal, PersistenceError> {
    let value = get_setting(pool, key).await?;
    parse_percent(&value).map_err(PersistenceError::InvalidDecimal)
}

pub async fn commission_rate_percent(pool: &SqlitePool) -> Result<Decimal, PersistenceError> {
    get_percent(pool, SettingKey::CommissionRatePercent).await
}

pub async fn prize_pool_share_percent(pool: &SqlitePool) -> Result<Decimal, PersistenceError> {
    get_percent(pool, SettingKey::PrizePoolSharePercent).await
}

pub async fn account_defaults(pool: &SqlitePool) -> Result<AccountDefaults, PersistenceError> {
    let group = get_setting(pool, SettingKey::DefaultGroup).await?;
    let leverage = get_setting(pool, SettingKey::DefaultLeverage).await?;
    let deposit = get_setting(pool, SettingKey::DefaultDepositCents).await?;

    Ok(AccountDefaults {
        group,
        leverage: leverage
            .parse()
            .map_err(|_| PersistenceError::InvalidEnumValue {
                column: "settings.default_leverage",
                value: leverage.clone(),
            })?,
        deposit_cents: deposit
            .parse()
            .map_err(|_| PersistenceError::InvalidEnumValue {
                column: "settings.default_deposit_cents",
                value: deposit.clone(),
            })?,
    })
}

pub async fn competition_timezone(pool: &SqlitePool) -> Result<Tz, PersistenceError> {
    let value = get_setting(pool, SettingKey::CompetitionTimezone).await?;
    value
        .parse()
        .map_err(|_| PersistenceError::InvalidEnumValue {
            column: "settings.competition_timezone",
            value,
        })
}
