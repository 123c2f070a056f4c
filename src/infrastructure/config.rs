use crate::domain::models::{WorkMode, WorkdayCalendar, parse_date, parse_weekday};
use crate::infrastructure::error::InfraError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::Path;

const APP_JSON: &str = "app.json";
const WORKDAYS_JSON: &str = "workdays.json";
pub const DEFAULT_DATE_PROPOSAL_LOOKAHEAD: u32 = 10;
const MAX_DATE_PROPOSAL_LOOKAHEAD: u64 = 366;

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigBundle {
    pub app: serde_json::Value,
    pub workdays: serde_json::Value,
}

fn default_files() -> HashMap<&'static str, serde_json::Value> {
    HashMap::from([
        (
            APP_JSON,
            serde_json::json!({
                "schema": 1,
                "appName": "Taskday",
                "dateProposalLookahead": DEFAULT_DATE_PROPOSAL_LOOKAHEAD
            }),
        ),
        (
            WORKDAYS_JSON,
            serde_json::json!({
                "schema": 1,
                "defaultModes": {
                    "Monday": "on_site",
                    "Tuesday": "on_site",
                    "Wednesday": "on_site",
                    "Thursday": "on_site",
                    "Friday": "on_site",
                    "Saturday": "off",
                    "Sunday": "off"
                },
                "holidays": []
            }),
        ),
    ])
}

pub fn ensure_default_configs(config_dir: &Path) -> Result<(), InfraError> {
    for (name, value) in default_files() {
        let path = config_dir.join(name);
        if !path.exists() {
            let formatted = serde_json::to_string_pretty(&value)?;
            fs::write(path, format!("{formatted}\n"))?;
        }
    }
    Ok(())
}

fn read_config(path: &Path) -> Result<serde_json::Value, InfraError> {
    let raw = fs::read_to_string(path)?;
    let parsed: serde_json::Value = serde_json::from_str(&raw)?;
    let schema = parsed
        .get("schema")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| InfraError::InvalidConfig(format!("missing schema in {}", path.display())))?;
    if schema != 1 {
        return Err(InfraError::InvalidConfig(format!(
            "unsupported schema {} in {}",
            schema,
            path.display()
        )));
    }
    Ok(parsed)
}

pub fn load_configs(config_dir: &Path) -> Result<ConfigBundle, InfraError> {
    Ok(ConfigBundle {
        app: read_config(&config_dir.join(APP_JSON))?,
        workdays: read_config(&config_dir.join(WORKDAYS_JSON))?,
    })
}

pub fn read_date_proposal_lookahead(config_dir: &Path) -> Result<u32, InfraError> {
    let path = config_dir.join(APP_JSON);
    let app = read_config(&path)?;
    let Some(raw) = app.get("dateProposalLookahead") else {
        return Ok(DEFAULT_DATE_PROPOSAL_LOOKAHEAD);
    };
    let value = raw
        .as_u64()
        .filter(|value| (1..=MAX_DATE_PROPOSAL_LOOKAHEAD).contains(value))
        .ok_or_else(|| {
            InfraError::InvalidConfig(format!(
                "dateProposalLookahead must be between 1 and {MAX_DATE_PROPOSAL_LOOKAHEAD} in {}",
                path.display()
            ))
        })?;
    Ok(value as u32)
}

pub fn load_workday_calendar(config_dir: &Path) -> Result<WorkdayCalendar, InfraError> {
    let path = config_dir.join(WORKDAYS_JSON);
    let workdays = read_config(&path)?;
    let mut calendar = WorkdayCalendar::default();

    if let Some(modes) = workdays
        .get("defaultModes")
        .and_then(serde_json::Value::as_object)
    {
        for (day, mode) in modes {
            let weekday = parse_weekday(day).ok_or_else(|| {
                InfraError::InvalidConfig(format!("unknown weekday '{day}' in {}", path.display()))
            })?;
            let mode = mode
                .as_str()
                .and_then(WorkMode::parse)
                .ok_or_else(|| {
                    InfraError::InvalidConfig(format!(
                        "invalid work mode for {day} in {}",
                        path.display()
                    ))
                })?;
            calendar.weekday_modes.insert(weekday, mode);
        }
    }

    let holidays = workdays
        .get("holidays")
        .and_then(serde_json::Value::as_array)
        .map(|values| {
            values
                .iter()
                .map(|value| {
                    value
                        .as_str()
                        .ok_or_else(|| "holidays[] must be strings".to_string())
                        .and_then(|raw| parse_date(raw, "holidays[]"))
                })
                .collect::<Result<BTreeSet<_>, String>>()
        })
        .transpose()
        .map_err(|message| InfraError::InvalidConfig(format!("{message} in {}", path.display())))?;
    if let Some(holidays) = holidays {
        calendar.holidays = holidays;
    }

    Ok(calendar)
}
