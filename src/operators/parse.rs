// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Parsing of the planner's textual `GROUP BY` expression.
//!
//! The planner hands every aggregation kernel triple the same expression,
//! in the relational-algebra text form, e.g.
//!
//! ```text
//! LogicalAggregate(group=[{0, 1}], EXPR$0=[SUM($2)], cnt=[COUNT()])
//! ```
//!
//! which parses into the [`AggregateSpec`] quadruple. Malformed input is a
//! [`Error::Parse`] and fatal to the query.

use crate::error::{Error, Result};
use crate::operators::{AggregateKind, AggregateSpec};

/// Parse the textual `GROUP BY` expression into the operator descriptor
pub fn parse_group_by_expression(expression: &str) -> Result<AggregateSpec> {
    let inner = extract_argument_list(expression)?;
    let segments = split_top_level(inner);

    let mut group_column_indices = Vec::new();
    let mut aggregation_input_expressions = Vec::new();
    let mut aggregation_types = Vec::new();
    let mut aggregation_column_assigned_aliases = Vec::new();
    let mut saw_group_clause = false;

    for segment in segments {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        if let Some(rest) = segment.strip_prefix("group=[{") {
            let list = rest.strip_suffix("}]").ok_or_else(|| {
                Error::Parse(format!("unterminated group clause in '{expression}'"))
            })?;
            group_column_indices = parse_index_list(list)?;
            saw_group_clause = true;
        } else {
            let (alias, call) = split_alias(segment)?;
            let (kind, input) = parse_aggregate_call(call)?;
            aggregation_column_assigned_aliases.push(alias.to_string());
            aggregation_types.push(kind);
            aggregation_input_expressions.push(input);
        }
    }

    if !saw_group_clause {
        return Err(Error::Parse(format!(
            "no group clause in aggregate expression '{expression}'"
        )));
    }
    if group_column_indices.is_empty() && aggregation_types.is_empty() {
        return Err(Error::Parse(format!(
            "aggregate with neither group columns nor aggregations: '{expression}'"
        )));
    }
    if aggregation_types.contains(&AggregateKind::CountDistinct) && aggregation_types.len() > 1 {
        return Err(Error::Parse(format!(
            "COUNT(DISTINCT ..) cannot be combined with other aggregations: '{expression}'"
        )));
    }

    Ok(AggregateSpec {
        group_column_indices,
        aggregation_input_expressions,
        aggregation_types,
        aggregation_column_assigned_aliases,
    })
}

/// Parse a `$i` column reference
pub fn parse_column_ref(expr: &str) -> Result<usize> {
    let expr = expr.trim();
    let index = expr
        .strip_prefix('$')
        .ok_or_else(|| Error::Parse(format!("expected column reference, got '{expr}'")))?;
    index
        .parse()
        .map_err(|_| Error::Parse(format!("invalid column reference '{expr}'")))
}

/// Parse a comma-separated list of `$i` column references
pub fn parse_column_refs(expr: &str) -> Result<Vec<usize>> {
    expr.split(',').map(parse_column_ref).collect()
}

/// The text between the wrapper's outer parentheses
fn extract_argument_list(expression: &str) -> Result<&str> {
    let open = expression
        .find('(')
        .ok_or_else(|| Error::Parse(format!("no argument list in '{expression}'")))?;
    let close = expression
        .rfind(')')
        .filter(|close| *close > open)
        .ok_or_else(|| Error::Parse(format!("unbalanced parentheses in '{expression}'")))?;
    Ok(&expression[open + 1..close])
}

/// Split on commas that sit outside any bracket nesting
fn split_top_level(inner: &str) -> Vec<&str> {
    let mut segments = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in inner.char_indices() {
        match c {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                segments.push(&inner[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    segments.push(&inner[start..]);
    segments
}

fn parse_index_list(list: &str) -> Result<Vec<usize>> {
    let list = list.trim();
    if list.is_empty() {
        return Ok(vec![]);
    }
    list.split(',')
        .map(|part| {
            part.trim()
                .parse()
                .map_err(|_| Error::Parse(format!("invalid group column index '{part}'")))
        })
        .collect()
}

/// Split `alias=[CALL]` into the alias and the call text
fn split_alias(segment: &str) -> Result<(&str, &str)> {
    let eq = segment
        .find("=[")
        .ok_or_else(|| Error::Parse(format!("expected alias=[..] segment, got '{segment}'")))?;
    let alias = segment[..eq].trim();
    let call = segment[eq + 2..]
        .strip_suffix(']')
        .ok_or_else(|| Error::Parse(format!("unterminated aggregate call in '{segment}'")))?;
    if alias.is_empty() {
        return Err(Error::Parse(format!("empty alias in '{segment}'")));
    }
    Ok((alias, call.trim()))
}

/// Parse one aggregate call, e.g. `SUM($2)`, `COUNT()`,
/// `COUNT(DISTINCT $1)`, `NTH_ELEMENT($0, 0)`
fn parse_aggregate_call(call: &str) -> Result<(AggregateKind, String)> {
    let open = call
        .find('(')
        .ok_or_else(|| Error::Parse(format!("expected aggregate call, got '{call}'")))?;
    let close = call
        .rfind(')')
        .filter(|close| *close > open)
        .ok_or_else(|| Error::Parse(format!("unbalanced aggregate call '{call}'")))?;
    let name = call[..open].trim();
    let args = call[open + 1..close].trim();

    match name {
        "SUM" => Ok((AggregateKind::Sum, parse_single_ref(args, name)?)),
        "$SUM0" | "SUM0" => Ok((AggregateKind::Sum0, parse_single_ref(args, name)?)),
        "AVG" => Ok((AggregateKind::Mean, parse_single_ref(args, name)?)),
        "MIN" => Ok((AggregateKind::Min, parse_single_ref(args, name)?)),
        "MAX" => Ok((AggregateKind::Max, parse_single_ref(args, name)?)),
        "COUNT" => {
            if args.is_empty() || args == "*" {
                Ok((AggregateKind::CountAll, String::new()))
            } else if let Some(arg) = args.strip_prefix("DISTINCT") {
                Ok((
                    AggregateKind::CountDistinct,
                    parse_single_ref(arg.trim(), name)?,
                ))
            } else {
                Ok((AggregateKind::CountValid, parse_single_ref(args, name)?))
            }
        }
        "NTH_ELEMENT" => {
            let mut parts = args.splitn(2, ',');
            let column = parts.next().unwrap_or("").trim();
            let n: i64 = parts
                .next()
                .unwrap_or("0")
                .trim()
                .parse()
                .map_err(|_| Error::Parse(format!("invalid NTH_ELEMENT offset in '{call}'")))?;
            if n != 0 {
                return Err(Error::Parse(format!(
                    "only NTH_ELEMENT(.., 0) is supported, got '{call}'"
                )));
            }
            Ok((AggregateKind::NthElement, parse_single_ref(column, "NTH_ELEMENT")?))
        }
        other => Err(Error::Parse(format!("unknown aggregate function '{other}'"))),
    }
}

fn parse_single_ref(args: &str, name: &str) -> Result<String> {
    parse_column_ref(args)
        .map(|index| format!("${index}"))
        .map_err(|_| Error::Parse(format!("{name} expects a single column argument, got '{args}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_grouped_aggregate() {
        let spec = parse_group_by_expression(
            "LogicalAggregate(group=[{0, 2}], EXPR$0=[SUM($1)], cnt=[COUNT()])",
        )
        .unwrap();
        assert_eq!(spec.group_column_indices, vec![0, 2]);
        assert_eq!(
            spec.aggregation_types,
            vec![AggregateKind::Sum, AggregateKind::CountAll]
        );
        assert_eq!(spec.aggregation_input_expressions, vec!["$1", ""]);
        assert_eq!(
            spec.aggregation_column_assigned_aliases,
            vec!["EXPR$0", "cnt"]
        );
        assert!(!spec.is_scalar_aggregation());
    }

    #[test]
    fn parses_scalar_aggregate() {
        let spec =
            parse_group_by_expression("LogicalAggregate(group=[{}], total=[SUM($0)])").unwrap();
        assert!(spec.group_column_indices.is_empty());
        assert!(spec.is_scalar_aggregation());
    }

    #[test]
    fn parses_distinct_only_group() {
        let spec = parse_group_by_expression("LogicalAggregate(group=[{1}])").unwrap();
        assert_eq!(spec.group_column_indices, vec![1]);
        assert!(spec.aggregation_types.is_empty());
    }

    #[test]
    fn parses_every_function() {
        let spec = parse_group_by_expression(
            "LogicalAggregate(group=[{0}], a=[SUM($1)], b=[$SUM0($1)], c=[COUNT($1)], \
             d=[AVG($1)], e=[MIN($1)], f=[MAX($1)], g=[NTH_ELEMENT($1, 0)])",
        )
        .unwrap();
        assert_eq!(
            spec.aggregation_types,
            vec![
                AggregateKind::Sum,
                AggregateKind::Sum0,
                AggregateKind::CountValid,
                AggregateKind::Mean,
                AggregateKind::Min,
                AggregateKind::Max,
                AggregateKind::NthElement,
            ]
        );
    }

    #[test]
    fn parses_count_distinct_alone() {
        let spec = parse_group_by_expression(
            "LogicalAggregate(group=[{0}], d=[COUNT(DISTINCT $1)])",
        )
        .unwrap();
        assert_eq!(spec.aggregation_types, vec![AggregateKind::CountDistinct]);
        assert_eq!(spec.aggregation_input_expressions, vec!["$1"]);
    }

    #[test]
    fn rejects_count_distinct_combined() {
        let err = parse_group_by_expression(
            "LogicalAggregate(group=[{0}], d=[COUNT(DISTINCT $1)], s=[SUM($1)])",
        )
        .unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn rejects_empty_aggregate() {
        let err = parse_group_by_expression("LogicalAggregate(group=[{}])").unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn rejects_malformed_expressions() {
        for expression in [
            "LogicalAggregate",
            "LogicalAggregate()",
            "LogicalAggregate(group=[{0)",
            "LogicalAggregate(group=[{0}], x=[FROB($1)])",
            "LogicalAggregate(group=[{a}])",
            "LogicalAggregate(group=[{0}], x=[SUM(v)])",
            "LogicalAggregate(group=[{0}], x=[NTH_ELEMENT($1, 3)])",
        ] {
            let result = parse_group_by_expression(expression);
            assert!(
                matches!(result, Err(Error::Parse(_))),
                "expected parse error for '{expression}', got {result:?}"
            );
        }
    }

    #[test]
    fn column_refs() {
        assert_eq!(parse_column_ref("$7").unwrap(), 7);
        assert_eq!(parse_column_refs("$3,$4").unwrap(), vec![3, 4]);
        assert!(parse_column_ref("7").is_err());
        assert!(parse_column_ref("$x").is_err());
    }
}
