//! Source runtimes: YIELD, READ CSV and LISTEN.
//!
//! Sources have no input ring buffer; the worker loop asks them for the
//! next batch of tuples and an optional pacing hint.

use crate::error::Error;
use crate::eval::eval_const;
use crate::Tuple;
use csv::ReaderBuilder;
use sluice_types::operation::{CsvColumn, ListenProtocol, Operation, SelectField};
use sluice_types::scalar::{ScalarType, ScalarValue};
use std::net::UdpSocket;
use std::time::Duration;

/// The default collectd network port.
const COLLECTD_PORT: u16 = 25826;

pub enum SourceRuntime {
    Yield {
        fields: Vec<SelectField>,
        every: Option<Duration>,
    },
    ReadCsv {
        rows: std::vec::IntoIter<Tuple>,
    },
    Listen {
        socket: UdpSocket,
        buf: Box<[u8; 65536]>,
    },
}

impl SourceRuntime {
    pub fn new(op: &Operation) -> Result<SourceRuntime, Error> {
        match op {
            Operation::Yield { fields, every } => Ok(SourceRuntime::Yield {
                fields: fields.clone(),
                every: every.map(Duration::from_secs_f64),
            }),
            Operation::ReadCsv {
                fields,
                path,
                separator,
            } => {
                let rows = read_csv(path, *separator, fields)?;
                Ok(SourceRuntime::ReadCsv {
                    rows: rows.into_iter(),
                })
            }
            Operation::Listen { protocol } => match protocol {
                ListenProtocol::Collectd => {
                    let socket = UdpSocket::bind(("0.0.0.0", COLLECTD_PORT))
                        .map_err(|e| Error::io("binding the collectd socket", e))?;
                    socket
                        .set_read_timeout(Some(Duration::from_millis(200)))
                        .map_err(|e| Error::io("configuring the collectd socket", e))?;
                    Ok(SourceRuntime::Listen {
                        socket,
                        buf: Box::new([0; 65536]),
                    })
                }
            },
            Operation::Aggregate { .. } => Err(Error::fatal("not a source operation")),
        }
    }

    /// Produce the next batch. `(tuples, pause)`: an empty batch with a
    /// pause means "sleep then ask again"; an empty batch without one
    /// means the source is exhausted.
    pub fn next_batch(&mut self) -> Result<(Vec<Tuple>, Option<Duration>), Error> {
        match self {
            SourceRuntime::Yield { fields, every } => {
                let mut tuple = Vec::with_capacity(fields.len());
                for f in fields.iter() {
                    tuple.push(eval_const(&f.expr)?);
                }
                // Without EVERY, pace modestly instead of spinning.
                let pause = every.unwrap_or(Duration::from_millis(10));
                Ok((vec![tuple], Some(pause)))
            }
            SourceRuntime::ReadCsv { rows } => {
                let batch: Vec<Tuple> = rows.by_ref().take(1024).collect();
                if batch.is_empty() {
                    Ok((Vec::new(), None))
                } else {
                    Ok((batch, Some(Duration::ZERO)))
                }
            }
            SourceRuntime::Listen { socket, buf } => match socket.recv(&mut buf[..]) {
                Ok(n) => Ok((parse_collectd(&buf[..n]), Some(Duration::ZERO))),
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    Ok((Vec::new(), Some(Duration::ZERO)))
                }
                Err(e) => Err(Error::io("receiving a collectd packet", e)),
            },
        }
    }
}

fn read_csv(path: &str, separator: char, columns: &[CsvColumn]) -> Result<Vec<Tuple>, Error> {
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .delimiter(separator as u8)
        .flexible(true)
        .from_path(path)
        .map_err(|e| Error::fatal(format!("cannot open CSV '{path}': {e}")))?;
    let mut rows = Vec::new();
    for (lineno, record) in reader.records().enumerate() {
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                log::warn!("{path}:{}: skipping unreadable record: {e}", lineno + 1);
                continue;
            }
        };
        let mut tuple = Vec::with_capacity(columns.len());
        let mut ok = true;
        for (i, col) in columns.iter().enumerate() {
            let raw = record.get(i).unwrap_or("");
            match parse_csv_value(raw, col) {
                Some(v) => tuple.push(v),
                None => {
                    log::warn!(
                        "{path}:{}: cannot parse {:?} as {} for field '{}'",
                        lineno + 1,
                        raw,
                        col.typ,
                        col.name
                    );
                    ok = false;
                    break;
                }
            }
        }
        if ok {
            rows.push(tuple);
        }
    }
    Ok(rows)
}

fn parse_csv_value(raw: &str, col: &CsvColumn) -> Option<ScalarValue> {
    if raw.is_empty() && col.nullable {
        return Some(ScalarValue::Null);
    }
    Some(match col.typ {
        ScalarType::Bool => ScalarValue::Bool(match raw {
            "true" | "TRUE" | "1" | "t" => true,
            "false" | "FALSE" | "0" | "f" => false,
            _ => return None,
        }),
        ScalarType::Float => ScalarValue::Float(raw.parse().ok()?),
        ScalarType::String => ScalarValue::String(raw.to_string()),
        ScalarType::Ip4 => ScalarValue::Ip4(raw.parse().ok()?),
        ScalarType::Ip6 => ScalarValue::Ip6(raw.parse().ok()?),
        ScalarType::Cidr4 => {
            let (addr, prefix) = raw.split_once('/')?;
            ScalarValue::Cidr4 {
                addr: addr.parse().ok()?,
                prefix: prefix.parse().ok()?,
            }
        }
        ScalarType::Cidr6 => {
            let (addr, prefix) = raw.split_once('/')?;
            ScalarValue::Cidr6 {
                addr: addr.parse().ok()?,
                prefix: prefix.parse().ok()?,
            }
        }
        t if t.is_integer() => ScalarValue::int_of(t, raw.parse::<i128>().ok()?)?,
        _ => return None,
    })
}

// Collectd binary protocol part types.
const PART_HOST: u16 = 0x0000;
const PART_TIME: u16 = 0x0001;
const PART_TIME_HR: u16 = 0x0008;
const PART_PLUGIN: u16 = 0x0002;
const PART_PLUGIN_INSTANCE: u16 = 0x0003;
const PART_TYPE: u16 = 0x0004;
const PART_TYPE_INSTANCE: u16 = 0x0005;
const PART_VALUES: u16 = 0x0006;

const DS_TYPE_COUNTER: u8 = 0;
const DS_TYPE_GAUGE: u8 = 1;
const DS_TYPE_DERIVE: u8 = 2;
const DS_TYPE_ABSOLUTE: u8 = 3;

/// Parse the numeric parts of one collectd binary packet into tuples of
/// the LISTEN FOR COLLECTD schema: (host, time, plugin, plugin_instance,
/// type_name, type_instance, value) — one tuple per encoded value.
fn parse_collectd(packet: &[u8]) -> Vec<Tuple> {
    let mut tuples = Vec::new();
    let mut host = String::new();
    let mut time = 0.0f64;
    let mut plugin: Option<String> = None;
    let mut plugin_instance: Option<String> = None;
    let mut type_name: Option<String> = None;
    let mut type_instance: Option<String> = None;

    let mut at = 0usize;
    while at + 4 <= packet.len() {
        let part_type = u16::from_be_bytes([packet[at], packet[at + 1]]);
        let part_len = u16::from_be_bytes([packet[at + 2], packet[at + 3]]) as usize;
        if part_len < 4 || at + part_len > packet.len() {
            break; // malformed: stop at what parsed so far
        }
        let body = &packet[at + 4..at + part_len];
        match part_type {
            PART_HOST => host = cstring(body),
            PART_PLUGIN => plugin = opt_cstring(body),
            PART_PLUGIN_INSTANCE => plugin_instance = opt_cstring(body),
            PART_TYPE => type_name = opt_cstring(body),
            PART_TYPE_INSTANCE => type_instance = opt_cstring(body),
            PART_TIME => {
                if let Some(v) = be_u64(body) {
                    time = v as f64;
                }
            }
            PART_TIME_HR => {
                if let Some(v) = be_u64(body) {
                    // 2^-30 second resolution.
                    time = v as f64 / (1u64 << 30) as f64;
                }
            }
            PART_VALUES => {
                let Some(count) = body
                    .get(..2)
                    .map(|b| u16::from_be_bytes([b[0], b[1]]) as usize)
                else {
                    break;
                };
                let types = &body[2..];
                if types.len() < count + count * 8 {
                    break;
                }
                for i in 0..count {
                    let ds_type = types[i];
                    let raw = &types[count + i * 8..count + (i + 1) * 8];
                    let value = match ds_type {
                        // Gauges are little-endian doubles; the counter
                        // family is big-endian integers.
                        DS_TYPE_GAUGE => f64::from_le_bytes(raw.try_into().unwrap()),
                        DS_TYPE_COUNTER | DS_TYPE_ABSOLUTE => {
                            u64::from_be_bytes(raw.try_into().unwrap()) as f64
                        }
                        DS_TYPE_DERIVE => i64::from_be_bytes(raw.try_into().unwrap()) as f64,
                        _ => continue,
                    };
                    tuples.push(vec![
                        ScalarValue::String(host.clone()),
                        ScalarValue::Float(time),
                        opt_string(&plugin),
                        opt_string(&plugin_instance),
                        opt_string(&type_name),
                        opt_string(&type_instance),
                        ScalarValue::Float(value),
                    ]);
                }
            }
            _ => {} // signatures, encrypted parts, intervals: ignored
        }
        at += part_len;
    }
    tuples
}

fn cstring(body: &[u8]) -> String {
    let end = body.iter().position(|b| *b == 0).unwrap_or(body.len());
    String::from_utf8_lossy(&body[..end]).into_owned()
}

fn opt_cstring(body: &[u8]) -> Option<String> {
    let s = cstring(body);
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

fn opt_string(s: &Option<String>) -> ScalarValue {
    match s {
        None => ScalarValue::Null,
        Some(s) => ScalarValue::String(s.clone()),
    }
}

fn be_u64(body: &[u8]) -> Option<u64> {
    body.get(..8).map(|b| u64::from_be_bytes(b.try_into().unwrap()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(ptype: u16, body: &[u8]) -> Vec<u8> {
        let mut v = Vec::new();
        v.extend((ptype).to_be_bytes());
        v.extend(((body.len() + 4) as u16).to_be_bytes());
        v.extend(body);
        v
    }

    fn string_part(ptype: u16, s: &str) -> Vec<u8> {
        let mut body = s.as_bytes().to_vec();
        body.push(0);
        part(ptype, &body)
    }

    #[test]
    fn collectd_packet_yields_one_tuple_per_value() {
        let mut packet = Vec::new();
        packet.extend(string_part(PART_HOST, "box-1"));
        packet.extend(part(PART_TIME, &1000u64.to_be_bytes()));
        packet.extend(string_part(PART_PLUGIN, "memory"));
        packet.extend(string_part(PART_TYPE_INSTANCE, "free"));
        // Two values: a gauge and a derive.
        let mut values = Vec::new();
        values.extend(2u16.to_be_bytes());
        values.push(DS_TYPE_GAUGE);
        values.push(DS_TYPE_DERIVE);
        values.extend(1234.5f64.to_le_bytes());
        values.extend(42i64.to_be_bytes());
        packet.extend(part(PART_VALUES, &values));

        let tuples = parse_collectd(&packet);
        assert_eq!(tuples.len(), 2);
        assert_eq!(tuples[0][0], ScalarValue::String("box-1".into()));
        assert_eq!(tuples[0][1], ScalarValue::Float(1000.0));
        assert_eq!(tuples[0][2], ScalarValue::String("memory".into()));
        assert_eq!(tuples[0][3], ScalarValue::Null); // no plugin_instance
        assert_eq!(tuples[0][5], ScalarValue::String("free".into()));
        assert_eq!(tuples[0][6], ScalarValue::Float(1234.5));
        assert_eq!(tuples[1][6], ScalarValue::Float(42.0));
    }

    #[test]
    fn malformed_packets_do_not_panic() {
        assert!(parse_collectd(&[]).is_empty());
        assert!(parse_collectd(&[0, 0, 0]).is_empty());
        assert!(parse_collectd(&[0, 6, 0, 2]).is_empty()); // length < 4
        let mut truncated = part(PART_VALUES, &[0, 5]);
        truncated.truncate(5);
        assert!(parse_collectd(&truncated).is_empty());
    }

    #[test]
    fn csv_rows_parse_against_the_declared_schema() {
        let dir = std::env::temp_dir().join("sluice-src-tests");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("mem.csv");
        std::fs::write(&path, "0,free,1000\n10,,600\nbad,x,1\n20,cached,300\n").unwrap();
        let cols = vec![
            CsvColumn {
                name: "time".into(),
                typ: ScalarType::Float,
                nullable: false,
            },
            CsvColumn {
                name: "type_instance".into(),
                typ: ScalarType::String,
                nullable: true,
            },
            CsvColumn {
                name: "value".into(),
                typ: ScalarType::Float,
                nullable: false,
            },
        ];
        let rows = read_csv(path.to_str().unwrap(), ',', &cols).unwrap();
        assert_eq!(rows.len(), 3); // the "bad" row is skipped
        assert_eq!(rows[1][1], ScalarValue::Null);
        assert_eq!(rows[2][2], ScalarValue::Float(300.0));
    }
}
