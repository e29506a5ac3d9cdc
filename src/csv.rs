use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use thiserror::Error;

use crate::Amount;
use crate::model::{Balance, Command, OrderNumber, UserId, luhn_valid};

/// Errors that can occur when reading command rows
#[derive(Debug, Error)]
pub enum CsvError {
    #[error("failed to open input: {0}")]
    Open(#[source] csv::Error),

    #[error("line {line}: failed to parse row: {source}")]
    Parse { line: usize, source: csv::Error },

    #[error("line {line}: unrecognized command type '{kind}'")]
    UnrecognizedType { line: usize, kind: String },

    #[error("line {line}: {kind} missing {field}")]
    MissingField {
        line: usize,
        kind: String,
        field: &'static str,
    },

    #[error("line {line}: invalid order number '{number}'")]
    InvalidOrderNumber { line: usize, number: String },

    #[error("line {line}: invalid amount '{amount}'")]
    InvalidAmount { line: usize, amount: f64 },
}

#[derive(Debug, Deserialize)]
struct InputRow {
    r#type: String,
    user: UserId,
    order: Option<String>,
    amount: Option<f64>,
}

#[derive(Debug, Serialize)]
struct OutputRow {
    user: UserId,
    current: String,
    withdrawn: String,
}

/// Read commands from a csv file
pub fn read_commands(
    path: impl AsRef<Path>,
) -> Result<impl Iterator<Item = Result<Command, CsvError>>, CsvError> {
    let reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)
        .map_err(CsvError::Open)?;

    Ok(reader
        .into_deserialize::<InputRow>()
        .enumerate()
        .map(|(idx, result)| {
            let line = idx + 2; // 1-indexed, skip header
            let row = result.map_err(|source| CsvError::Parse { line, source })?;
            parse_row(line, row)
        }))
}

fn parse_row(line: usize, row: InputRow) -> Result<Command, CsvError> {
    let user = row.user;
    match row.r#type.as_str() {
        "register" => Ok(Command::Register { user }),
        "order" => Ok(Command::SubmitOrder {
            user,
            number: order_number(line, &row)?,
        }),
        "withdraw" => {
            let order_ref = order_number(line, &row)?;
            let amount = row.amount.ok_or_else(|| CsvError::MissingField {
                line,
                kind: row.r#type.clone(),
                field: "amount",
            })?;
            let amount = Amount::try_from_float(amount)
                .ok_or(CsvError::InvalidAmount { line, amount })?;
            Ok(Command::Withdraw {
                user,
                order_ref,
                amount,
            })
        }
        other => Err(CsvError::UnrecognizedType {
            line,
            kind: other.to_string(),
        }),
    }
}

fn order_number(line: usize, row: &InputRow) -> Result<OrderNumber, CsvError> {
    let number = row
        .order
        .as_deref()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| CsvError::MissingField {
            line,
            kind: row.r#type.clone(),
            field: "order",
        })?;

    if !luhn_valid(number) {
        return Err(CsvError::InvalidOrderNumber {
            line,
            number: number.to_string(),
        });
    }
    Ok(OrderNumber::new(number))
}

/// Write balances in csv format
pub fn write_balances(
    writer: impl io::Write,
    balances: impl IntoIterator<Item = (UserId, Balance)>,
) -> Result<(), csv::Error> {
    let mut writer = csv::Writer::from_writer(writer);

    for (user, balance) in balances {
        writer.serialize(OutputRow {
            user,
            current: balance.current.to_string(),
            withdrawn: balance.withdrawn.to_string(),
        })?;
    }

    writer.flush()?;
    Ok(())
}
