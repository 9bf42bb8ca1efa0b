// =============================================================================
// Instrument master — token ↔ tradingsymbol mapping for the tick channel
// =============================================================================
//
// The broker publishes the day's instrument dump as CSV. The WebSocket feed
// identifies instruments only by numeric token, so the adapter loads this
// mapping at connect time and keeps it in memory for the life of the
// session.
// =============================================================================

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use tracing::warn;

use crate::broker::Instrument;

/// Bidirectional token/symbol lookup built from the instrument dump.
#[derive(Debug, Default)]
pub struct InstrumentMap {
    by_symbol: HashMap<String, u32>,
    by_token: HashMap<u32, String>,
    instruments: Vec<Instrument>,
}

impl InstrumentMap {
    pub fn from_instruments(instruments: Vec<Instrument>) -> Self {
        let mut by_symbol = HashMap::with_capacity(instruments.len());
        let mut by_token = HashMap::with_capacity(instruments.len());
        for inst in &instruments {
            by_symbol.insert(inst.tradingsymbol.clone(), inst.instrument_token);
            by_token.insert(inst.instrument_token, inst.tradingsymbol.clone());
        }
        Self {
            by_symbol,
            by_token,
            instruments,
        }
    }

    pub fn token_for(&self, symbol: &str) -> Option<u32> {
        self.by_symbol.get(symbol).copied()
    }

    pub fn symbol_for(&self, token: u32) -> Option<&str> {
        self.by_token.get(&token).map(String::as_str)
    }

    pub fn instruments(&self) -> &[Instrument] {
        &self.instruments
    }

    pub fn len(&self) -> usize {
        self.instruments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty()
    }
}

/// Parse the broker's instrument-dump CSV. Columns are located by header
/// name, so column reordering upstream does not break the load. Rows that
/// fail to parse are skipped with a warning rather than failing the dump.
pub fn parse_instruments_csv(text: &str) -> Result<Vec<Instrument>> {
    let mut lines = text.lines();
    let header = lines.next().ok_or_else(|| anyhow!("empty instrument dump"))?;

    let columns: Vec<&str> = header.split(',').map(str::trim).collect();
    let idx = |name: &str| -> Result<usize> {
        columns
            .iter()
            .position(|c| *c == name)
            .ok_or_else(|| anyhow!("instrument dump missing column '{name}'"))
    };

    let token_idx = idx("instrument_token")?;
    let symbol_idx = idx("tradingsymbol")?;
    let exchange_idx = idx("exchange")?;
    let type_idx = idx("instrument_type")?;
    let tick_idx = idx("tick_size")?;
    let lot_idx = idx("lot_size")?;

    let mut out = Vec::new();
    for (line_no, line) in lines.enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').collect();

        let parsed = (|| -> Option<Instrument> {
            Some(Instrument {
                instrument_token: fields.get(token_idx)?.trim().parse().ok()?,
                tradingsymbol: fields.get(symbol_idx)?.trim().to_string(),
                exchange: fields.get(exchange_idx)?.trim().to_string(),
                instrument_type: fields.get(type_idx)?.trim().to_string(),
                tick_size: fields.get(tick_idx)?.trim().parse().ok()?,
                lot_size: fields.get(lot_idx)?.trim().parse().ok()?,
            })
        })();

        match parsed {
            Some(inst) => out.push(inst),
            None => warn!(line = line_no + 2, "skipping malformed instrument row"),
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DUMP: &str = "\
instrument_token,exchange_token,tradingsymbol,name,last_price,expiry,strike,tick_size,lot_size,instrument_type,segment,exchange
738561,2885,RELIANCE,RELIANCE INDUSTRIES,0,,0,0.05,1,EQ,NSE,NSE
2953217,11536,TCS,TATA CONSULTANCY SERV,0,,0,0.05,1,EQ,NSE,NSE
not-a-number,1,BROKEN,BROKEN ROW,0,,0,0.05,1,EQ,NSE,NSE
";

    #[test]
    fn parses_rows_and_skips_malformed() {
        let instruments = parse_instruments_csv(DUMP).unwrap();
        assert_eq!(instruments.len(), 2);
        assert_eq!(instruments[0].tradingsymbol, "RELIANCE");
        assert_eq!(instruments[0].instrument_token, 738561);
        assert!((instruments[0].tick_size - 0.05).abs() < f64::EPSILON);
    }

    #[test]
    fn map_is_bidirectional() {
        let map = InstrumentMap::from_instruments(parse_instruments_csv(DUMP).unwrap());
        assert_eq!(map.token_for("TCS"), Some(2953217));
        assert_eq!(map.symbol_for(738561), Some("RELIANCE"));
        assert_eq!(map.token_for("MISSING"), None);
        assert_eq!(map.symbol_for(1), None);
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn missing_header_column_is_an_error() {
        let bad = "a,b,c\n1,2,3\n";
        assert!(parse_instruments_csv(bad).is_err());
    }
}
