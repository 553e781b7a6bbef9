//! Host list expressions such as `node[01-03,7],login1`.

use crate::error::{Error, Result};

/// Splits `expr` at commas that are not inside brackets.
fn split_top(expr: &str) -> Result<Vec<&str>> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in expr.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(&expr[start..i]);
                start = i + 1;
            }
            _ => {}
        }
        if !(0..=1).contains(&depth) {
            return Err(Error::BadParam(format!("unbalanced brackets in {:?}", expr)));
        }
    }
    if depth != 0 {
        return Err(Error::BadParam(format!("unbalanced brackets in {:?}", expr)));
    }
    parts.push(&expr[start..]);
    Ok(parts.into_iter().map(str::trim).filter(|p| !p.is_empty()).collect())
}

fn expand_one(item: &str, out: &mut Vec<String>) -> Result<()> {
    let Some(open) = item.find('[') else {
        out.push(item.to_string());
        return Ok(());
    };
    let close = item
        .rfind(']')
        .filter(|close| *close > open)
        .ok_or_else(|| Error::BadParam(format!("bad host range {:?}", item)))?;
    let (prefix, suffix) = (&item[..open], &item[close + 1..]);

    for range in item[open + 1..close].split(',') {
        let range = range.trim();
        let (lo, hi) = range.split_once('-').unwrap_or((range, range));
        let width = lo.len();
        let bad = || Error::BadParam(format!("bad host range {:?}", range));
        let lo: u64 = lo.parse().map_err(|_| bad())?;
        let hi: u64 = hi.parse().map_err(|_| bad())?;
        if hi < lo {
            return Err(bad());
        }
        for n in lo..=hi {
            out.push(format!("{}{:0width$}{}", prefix, n, suffix, width = width));
        }
    }
    Ok(())
}

pub fn expand(expr: &str) -> Result<Vec<String>> {
    let mut hosts = Vec::new();
    for item in split_top(expr)? {
        expand_one(item, &mut hosts)?;
    }
    Ok(hosts)
}

// "node007" -> ("node", "007")
fn split_numeric(host: &str) -> (&str, &str) {
    let digits = host.bytes().rev().take_while(u8::is_ascii_digit).count();
    host.split_at(host.len() - digits)
}

/// Inverse of `expand`. Only neighbouring hosts are folded together so the
/// order, and therefore every host's index, is preserved.
pub fn compress<S: AsRef<str>>(hosts: &[S]) -> String {
    struct Group<'a> {
        prefix: &'a str,
        width: usize,
        ranges: Vec<(u64, u64)>,
    }

    let mut groups: Vec<Group> = Vec::new();

    for host in hosts.iter().map(AsRef::as_ref) {
        let (prefix, digits) = split_numeric(host);
        let Ok(n) = digits.parse::<u64>() else {
            groups.push(Group {
                prefix: host,
                width: 0,
                ranges: Vec::new(),
            });
            continue;
        };
        if let Some(last) = groups.last_mut() {
            if !last.ranges.is_empty() && last.prefix == prefix && last.width == digits.len() {
                if let Some(range) = last.ranges.last_mut() {
                    if range.1 + 1 == n {
                        range.1 = n;
                        continue;
                    }
                }
                last.ranges.push((n, n));
                continue;
            }
        }
        groups.push(Group {
            prefix,
            width: digits.len(),
            ranges: vec![(n, n)],
        });
    }

    let render = |group: &Group| -> String {
        if group.ranges.is_empty() {
            return group.prefix.to_string();
        }
        let width = group.width;
        let ranges: Vec<String> = group
            .ranges
            .iter()
            .map(|&(lo, hi)| {
                if lo == hi {
                    format!("{:0width$}", lo, width = width)
                } else {
                    format!("{:0width$}-{:0width$}", lo, hi, width = width)
                }
            })
            .collect();
        if group.ranges.len() == 1 && group.ranges[0].0 == group.ranges[0].1 {
            format!("{}{}", group.prefix, ranges[0])
        } else {
            format!("{}[{}]", group.prefix, ranges.join(","))
        }
    };

    groups.iter().map(render).collect::<Vec<_>>().join(",")
}
