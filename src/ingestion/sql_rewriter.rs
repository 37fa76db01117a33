//! SQL Rewriter - Points user-supplied source SQL at downloaded batch files
//!
//! The user writes ordinary read-side SQL (casts, filters, joins) around a
//! single `read_csv(...)` / `read_parquet(...)` / `read_json(...)` call.
//! Per batch, only that call's path argument is replaced; everything else in
//! the statement is rendered back unchanged.

use sqlparser::ast::{
    Array, Expr, FunctionArg, FunctionArgExpr, JoinConstraint, JoinOperator, Query, SelectItem,
    SetExpr, Statement, TableFactor, TableWithJoins, Value,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer};

use super::SourceFormat;
use crate::error::{IngestError, Result};

const FILE_FUNCTIONS: &[&str] = &[
    "read_csv",
    "read_csv_auto",
    "read_parquet",
    "parquet_scan",
    "read_json",
    "read_json_auto",
    "read_ndjson",
    "read_ndjson_auto",
];

/// A parsed source statement with exactly one file-reading reference
#[derive(Debug, Clone)]
pub struct SourceSql {
    statement: Statement,
    function: String,
    path: String,
}

impl SourceSql {
    pub fn parse(sql: &str) -> Result<Self> {
        let dialect = GenericDialect {};
        let mut statements =
            Parser::parse_sql(&dialect, sql).map_err(|e| IngestError::InvalidSql(e.to_string()))?;

        if statements.len() != 1 {
            return Err(IngestError::InvalidSql(format!(
                "expected a single statement, found {}",
                statements.len()
            )));
        }
        let mut statement = statements.remove(0);
        if !matches!(statement, Statement::Query(_)) {
            return Err(IngestError::InvalidSql(
                "source SQL must be a SELECT query".to_string(),
            ));
        }

        let mut references: Vec<(String, Vec<FunctionArg>)> = Vec::new();
        for_each_file_reference(&mut statement, &mut |name, args| {
            references.push((name.to_string(), args.clone()));
        });

        // Calls the walk cannot rewrite (scalar use, exotic expression
        // positions) still count against the single-reference rule.
        let calls = count_file_calls(sql)?;
        let (function, args) = match references.len().max(calls) {
            0 => return Err(IngestError::NoFileReference),
            1 if references.len() == 1 => references.remove(0),
            1 => {
                return Err(IngestError::InvalidSql(
                    "file-reading functions must appear as a table in FROM or JOIN".to_string(),
                ))
            }
            n => return Err(IngestError::MultipleSourceReferences(n)),
        };

        let path_expr = path_argument(&args).ok_or(IngestError::NoFileReference)?;
        let mut paths = extract_paths(path_expr);
        let path = match paths.len() {
            0 => {
                return Err(IngestError::InvalidSql(format!(
                    "{function} must be given a string literal path, found {path_expr}"
                )))
            }
            1 => paths.remove(0),
            n => return Err(IngestError::MultiplePathsUnsupported(n)),
        };

        Ok(Self {
            statement,
            function,
            path,
        })
    }

    /// The path (or glob) the user's statement reads
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Lower-cased name of the file-reading function
    pub fn function(&self) -> &str {
        &self.function
    }

    pub fn format(&self) -> Option<SourceFormat> {
        SourceFormat::from_function(&self.function)
    }

    /// Render the statement reading `paths` instead of the original path
    pub fn rewrite(&self, paths: &[String]) -> String {
        let mut statement = self.statement.clone();
        let replacement = Expr::Array(Array {
            elem: paths
                .iter()
                .map(|p| Expr::Value(Value::SingleQuotedString(p.clone())))
                .collect(),
            named: false,
        });

        for_each_file_reference(&mut statement, &mut |_, args| {
            if let Some(slot) = args.iter_mut().find_map(|arg| match arg {
                FunctionArg::Unnamed(FunctionArgExpr::Expr(expr)) => Some(expr),
                _ => None,
            }) {
                *slot = replacement.clone();
            }
        });

        statement.to_string()
    }
}

fn is_file_function(name: &str) -> bool {
    FILE_FUNCTIONS.contains(&name)
}

/// First positional argument of a table function, which holds its path(s)
fn path_argument(args: &[FunctionArg]) -> Option<&Expr> {
    args.iter().find_map(|arg| match arg {
        FunctionArg::Unnamed(FunctionArgExpr::Expr(expr)) => Some(expr),
        _ => None,
    })
}

fn extract_paths(expr: &Expr) -> Vec<String> {
    match expr {
        Expr::Value(Value::SingleQuotedString(s)) | Expr::Value(Value::DoubleQuotedString(s)) => {
            vec![s.clone()]
        }
        Expr::Array(array) => array.elem.iter().flat_map(extract_paths).collect(),
        _ => Vec::new(),
    }
}

/// Number of `<file function>(` call sites in the raw statement text
fn count_file_calls(sql: &str) -> Result<usize> {
    let dialect = GenericDialect {};
    let tokens = Tokenizer::new(&dialect, sql)
        .tokenize()
        .map_err(|e| IngestError::InvalidSql(e.to_string()))?;
    let significant: Vec<&Token> = tokens
        .iter()
        .filter(|t| !matches!(t, Token::Whitespace(_)))
        .collect();

    Ok(significant
        .windows(2)
        .filter(|pair| match (pair[0], pair[1]) {
            (Token::Word(word), Token::LParen) => {
                word.quote_style.is_none() && is_file_function(&word.value.to_lowercase())
            }
            _ => false,
        })
        .count())
}

/// Call `f` with the lower-cased function name and argument list of every
/// file-reading table function in the statement, including those nested in
/// CTEs, derived tables, parenthesized joins, set operations and subquery
/// expressions.
fn for_each_file_reference(
    statement: &mut Statement,
    f: &mut dyn FnMut(&str, &mut Vec<FunctionArg>),
) {
    if let Statement::Query(query) = statement {
        walk_query(query, &mut |factor| {
            if let TableFactor::Table {
                name,
                args: Some(args),
                ..
            } = factor
            {
                let function = name
                    .0
                    .last()
                    .map(|ident| ident.value.to_lowercase())
                    .unwrap_or_default();
                if is_file_function(&function) {
                    f(&function, args);
                }
            }
        });
    }
}

fn walk_query(query: &mut Query, f: &mut dyn FnMut(&mut TableFactor)) {
    if let Some(with) = query.with.as_mut() {
        for cte in with.cte_tables.iter_mut() {
            walk_query(&mut cte.query, f);
        }
    }
    walk_set_expr(&mut query.body, f);
    for order in query.order_by.iter_mut() {
        walk_expr(&mut order.expr, f);
    }
}

fn walk_set_expr(body: &mut SetExpr, f: &mut dyn FnMut(&mut TableFactor)) {
    match body {
        SetExpr::Select(select) => {
            for item in select.projection.iter_mut() {
                match item {
                    SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => {
                        walk_expr(expr, f)
                    }
                    _ => {}
                }
            }
            for table in select.from.iter_mut() {
                walk_table_with_joins(table, f);
            }
            if let Some(selection) = select.selection.as_mut() {
                walk_expr(selection, f);
            }
            if let Some(having) = select.having.as_mut() {
                walk_expr(having, f);
            }
        }
        SetExpr::Query(query) => walk_query(query, f),
        SetExpr::SetOperation { left, right, .. } => {
            walk_set_expr(left, f);
            walk_set_expr(right, f);
        }
        _ => {}
    }
}

fn walk_table_with_joins(table: &mut TableWithJoins, f: &mut dyn FnMut(&mut TableFactor)) {
    walk_factor(&mut table.relation, f);
    for join in table.joins.iter_mut() {
        walk_factor(&mut join.relation, f);
        let constraint = match &mut join.join_operator {
            JoinOperator::Inner(c)
            | JoinOperator::LeftOuter(c)
            | JoinOperator::RightOuter(c)
            | JoinOperator::FullOuter(c) => Some(c),
            _ => None,
        };
        if let Some(JoinConstraint::On(expr)) = constraint {
            walk_expr(expr, f);
        }
    }
}

fn walk_factor(factor: &mut TableFactor, f: &mut dyn FnMut(&mut TableFactor)) {
    match factor {
        TableFactor::Derived { subquery, .. } => walk_query(subquery, f),
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => walk_table_with_joins(table_with_joins, f),
        other => f(other),
    }
}

fn walk_expr(expr: &mut Expr, f: &mut dyn FnMut(&mut TableFactor)) {
    match expr {
        Expr::Subquery(query) => walk_query(query, f),
        Expr::Exists { subquery, .. } => walk_query(subquery, f),
        Expr::InSubquery { expr, subquery, .. } => {
            walk_expr(expr, f);
            walk_query(subquery, f);
        }
        Expr::BinaryOp { left, right, .. } => {
            walk_expr(left, f);
            walk_expr(right, f);
        }
        Expr::UnaryOp { expr, .. }
        | Expr::Nested(expr)
        | Expr::Cast { expr, .. }
        | Expr::TryCast { expr, .. }
        | Expr::IsNull(expr)
        | Expr::IsNotNull(expr)
        | Expr::IsTrue(expr)
        | Expr::IsFalse(expr) => walk_expr(expr, f),
        Expr::Between {
            expr, low, high, ..
        } => {
            walk_expr(expr, f);
            walk_expr(low, f);
            walk_expr(high, f);
        }
        Expr::Like { expr, pattern, .. } | Expr::ILike { expr, pattern, .. } => {
            walk_expr(expr, f);
            walk_expr(pattern, f);
        }
        Expr::InList { expr, list, .. } => {
            walk_expr(expr, f);
            for item in list.iter_mut() {
                walk_expr(item, f);
            }
        }
        Expr::Tuple(items) => {
            for item in items.iter_mut() {
                walk_expr(item, f);
            }
        }
        Expr::Case {
            operand,
            conditions,
            results,
            else_result,
        } => {
            if let Some(operand) = operand.as_mut() {
                walk_expr(operand, f);
            }
            for item in conditions.iter_mut().chain(results.iter_mut()) {
                walk_expr(item, f);
            }
            if let Some(else_result) = else_result.as_mut() {
                walk_expr(else_result, f);
            }
        }
        Expr::Function(function) => {
            for arg in function.args.iter_mut() {
                match arg {
                    FunctionArg::Unnamed(FunctionArgExpr::Expr(e))
                    | FunctionArg::Named {
                        arg: FunctionArgExpr::Expr(e),
                        ..
                    } => walk_expr(e, f),
                    _ => {}
                }
            }
        }
        _ => {}
    }
}
