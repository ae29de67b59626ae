//! Site directory: the named console endpoints operators can dial.

use std::fs;
use std::path::Path;
use thiserror::Error;

/// One remote console endpoint. Built at startup from the site directory
/// file and never mutated afterwards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Site {
    pub name: String,
    pub phone: String,
    pub description: String,
    /// Nominal line rate of the far end. Informational only; nothing is
    /// programmed on the serial side.
    pub baud_rate: u32,
    /// Optional AT commands run between reset and dial (modulation limiters
    /// and the like).
    pub modem_init: Vec<String>,
}

#[derive(Debug, Error)]
pub enum SitesError {
    #[error("line {line}: expected 4-5 pipe-delimited fields, got {count}")]
    FieldCount { line: usize, count: usize },
    #[error("line {line}: invalid baud rate {value:?}")]
    BadBaudRate { line: usize, value: String },
    #[error("reading sites file: {0}")]
    Io(#[from] std::io::Error),
}

/// Parse site definitions. Each non-blank, non-comment line is
/// `name|phone|description|baud_rate` with an optional fifth field holding a
/// semicolon-separated list of modem init commands.
pub fn parse_sites(input: &str) -> Result<Vec<Site>, SitesError> {
    let mut sites = Vec::new();
    for (idx, raw) in input.lines().enumerate() {
        let line_num = idx + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let parts: Vec<&str> = line.splitn(5, '|').collect();
        if parts.len() < 4 {
            return Err(SitesError::FieldCount {
                line: line_num,
                count: parts.len(),
            });
        }

        let baud_field = parts[3].trim();
        let baud_rate: u32 = baud_field.parse().map_err(|_| SitesError::BadBaudRate {
            line: line_num,
            value: parts[3].to_string(),
        })?;
        if baud_rate == 0 {
            return Err(SitesError::BadBaudRate {
                line: line_num,
                value: parts[3].to_string(),
            });
        }

        let modem_init = match parts.get(4) {
            Some(field) => field
                .split(';')
                .map(str::trim)
                .filter(|cmd| !cmd.is_empty())
                .map(str::to_string)
                .collect(),
            None => Vec::new(),
        };

        sites.push(Site {
            name: parts[0].trim().to_string(),
            phone: parts[1].trim().to_string(),
            description: parts[2].trim().to_string(),
            baud_rate,
            modem_init,
        });
    }
    Ok(sites)
}

pub fn parse_sites_file(path: &Path) -> Result<Vec<Site>, SitesError> {
    let contents = fs::read_to_string(path)?;
    parse_sites(&contents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_directory() {
        let input = "\
# comment line
2broadway|14105551234|Core router lights-out|9600

annex|15555550100|Annex PDU console|2400
lab|15555550101|Lab switch|19200
";
        let sites = parse_sites(input).unwrap();
        assert_eq!(sites.len(), 3);
        assert_eq!(sites[0].name, "2broadway");
        assert_eq!(sites[0].phone, "14105551234");
        assert_eq!(sites[0].description, "Core router lights-out");
        assert_eq!(sites[0].baud_rate, 9600);
        assert!(sites[0].modem_init.is_empty());
        assert_eq!(sites[2].baud_rate, 19200);
    }

    #[test]
    fn fifth_field_is_ordered_init_commands() {
        let input = "slow|15555550102|V.32 only|4800|AT+MS=132,0,4800,9600; ATS7=60";
        let sites = parse_sites(input).unwrap();
        assert_eq!(
            sites[0].modem_init,
            vec!["AT+MS=132,0,4800,9600".to_string(), "ATS7=60".to_string()]
        );
    }

    #[test]
    fn empty_init_entries_are_skipped() {
        let input = "a|1|x|1200|;;ATX3;";
        let sites = parse_sites(input).unwrap();
        assert_eq!(sites[0].modem_init, vec!["ATX3".to_string()]);
    }

    #[test]
    fn fields_are_trimmed() {
        let input = "  a  | 123 |  desc  | 9600 ";
        let sites = parse_sites(input).unwrap();
        assert_eq!(sites[0].name, "a");
        assert_eq!(sites[0].phone, "123");
        assert_eq!(sites[0].description, "desc");
        assert_eq!(sites[0].baud_rate, 9600);
    }

    #[test]
    fn short_line_reports_line_and_count() {
        let input = "ok|1|x|9600\nbad|only|three";
        let err = parse_sites(input).unwrap_err();
        match err {
            SitesError::FieldCount { line, count } => {
                assert_eq!(line, 2);
                assert_eq!(count, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn bad_baud_reports_raw_value() {
        let input = "a|1|x|fast";
        let err = parse_sites(input).unwrap_err();
        match err {
            SitesError::BadBaudRate { line, value } => {
                assert_eq!(line, 1);
                assert_eq!(value, "fast");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn zero_baud_is_rejected() {
        assert!(parse_sites("a|1|x|0").is_err());
    }
}
