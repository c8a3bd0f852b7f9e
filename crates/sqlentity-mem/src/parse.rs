//! Statement compilation.
//!
//! Statements are parsed once at prepare time into a small command model
//! the executor walks directly. Placeholders are numbered left to right
//! in textual order, matching positional binding. Only the SQL shapes
//! the persistence layer emits are accepted: single-table INSERT,
//! UPDATE (including `col = col + n` arithmetic), DELETE, SELECT with
//! conjunctive predicates, IN lists, ORDER BY and FOR UPDATE, plus
//! CREATE TABLE with PRIMARY KEY and NOT NULL column options.

use sqlentity_core::error::QueryError;
use sqlentity_core::{Error, Result, Value};
use sqlparser::ast as sql;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ColumnKind {
    Bool,
    Int,
    BigInt,
    Double,
    Text,
    Bytes,
}

#[derive(Debug, Clone)]
pub(crate) struct ColumnSpec {
    pub name: String,
    pub kind: ColumnKind,
    pub nullable: bool,
    pub primary_key: bool,
}

/// A literal from the statement text or a positional placeholder.
#[derive(Debug, Clone)]
pub(crate) enum Operand {
    Literal(Value),
    Param(usize),
}

/// Right-hand side of a SET assignment.
#[derive(Debug, Clone)]
pub(crate) enum AssignValue {
    Set(Operand),
    /// `column = column + n` (or `- n`), evaluated against the current row.
    Arith {
        column: String,
        negate: bool,
        operand: Operand,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CmpOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

#[derive(Debug, Clone)]
pub(crate) enum Predicate {
    Compare {
        column: String,
        op: CmpOp,
        operand: Operand,
    },
    In {
        column: String,
        list: Vec<Operand>,
        negated: bool,
    },
    IsNull {
        column: String,
        negated: bool,
    },
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
}

#[derive(Debug, Clone)]
pub(crate) enum Projection {
    All,
    Columns(Vec<String>),
}

#[derive(Debug, Clone)]
pub(crate) enum Command {
    CreateTable {
        table: String,
        columns: Vec<ColumnSpec>,
    },
    Insert {
        table: String,
        /// Empty means positional insert over the table's column order.
        columns: Vec<String>,
        values: Vec<Operand>,
    },
    Update {
        table: String,
        assignments: Vec<(String, AssignValue)>,
        predicate: Option<Predicate>,
    },
    Delete {
        table: String,
        predicate: Option<Predicate>,
    },
    Select {
        table: String,
        projection: Projection,
        predicate: Option<Predicate>,
        order_by: Vec<(String, bool)>,
        for_update: bool,
    },
}

impl Command {
    pub(crate) fn is_query(&self) -> bool {
        matches!(self, Command::Select { .. })
    }
}

#[derive(Default)]
struct ParamCounter {
    next: usize,
}

impl ParamCounter {
    fn take(&mut self) -> usize {
        let index = self.next;
        self.next += 1;
        index
    }
}

pub(crate) fn parse_command(text: &str) -> Result<Command> {
    let mut stmts = Parser::parse_sql(&GenericDialect {}, text)
        .map_err(|e| Error::Query(QueryError::syntax(text, e.to_string())))?;
    if stmts.len() != 1 {
        return Err(syntax(text, "expected exactly one statement"));
    }
    let mut params = ParamCounter::default();
    match stmts.remove(0) {
        sql::Statement::CreateTable(create) => convert_create(text, create),
        sql::Statement::Insert(insert) => convert_insert(text, insert, &mut params),
        sql::Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => convert_update(text, table, assignments, selection, &mut params),
        sql::Statement::Delete(delete) => convert_delete(text, delete, &mut params),
        sql::Statement::Query(query) => convert_select(text, *query, &mut params),
        other => Err(unsupported(text, format!("statement {other}"))),
    }
}

fn syntax(text: &str, message: impl Into<String>) -> Error {
    Error::Query(QueryError::syntax(text, message))
}

fn unsupported(text: &str, what: impl std::fmt::Display) -> Error {
    Error::Query(QueryError::syntax(text, format!("unsupported SQL: {what}")))
}

fn convert_create(text: &str, create: sql::CreateTable) -> Result<Command> {
    let table = object_name(text, &create.name)?;
    let mut columns = Vec::with_capacity(create.columns.len());
    for col in create.columns {
        let kind = column_kind(text, &col.data_type)?;
        let mut nullable = true;
        let mut primary_key = false;
        for opt in &col.options {
            match &opt.option {
                sql::ColumnOption::NotNull => nullable = false,
                sql::ColumnOption::Unique { is_primary, .. } if *is_primary => {
                    primary_key = true;
                    nullable = false;
                }
                _ => {}
            }
        }
        columns.push(ColumnSpec {
            name: col.name.value,
            kind,
            nullable,
            primary_key,
        });
    }
    if columns.is_empty() {
        return Err(syntax(text, "CREATE TABLE needs at least one column"));
    }
    Ok(Command::CreateTable { table, columns })
}

fn column_kind(text: &str, data_type: &sql::DataType) -> Result<ColumnKind> {
    match data_type {
        sql::DataType::Boolean | sql::DataType::Bool => Ok(ColumnKind::Bool),
        sql::DataType::Int(_) | sql::DataType::Integer(_) => Ok(ColumnKind::Int),
        sql::DataType::BigInt(_) => Ok(ColumnKind::BigInt),
        sql::DataType::Double(_)
        | sql::DataType::DoublePrecision
        | sql::DataType::Float(_)
        | sql::DataType::Real => Ok(ColumnKind::Double),
        sql::DataType::Text | sql::DataType::Varchar(_) | sql::DataType::String(_) => {
            Ok(ColumnKind::Text)
        }
        sql::DataType::Blob(_) | sql::DataType::Bytea => Ok(ColumnKind::Bytes),
        other => Err(unsupported(text, format!("column type {other}"))),
    }
}

fn convert_insert(text: &str, insert: sql::Insert, params: &mut ParamCounter) -> Result<Command> {
    let table = insert.table.to_string();
    let columns: Vec<String> = insert.columns.into_iter().map(|c| c.value).collect();
    let source = insert
        .source
        .ok_or_else(|| unsupported(text, "INSERT without VALUES"))?;
    let sql::SetExpr::Values(values) = *source.body else {
        return Err(unsupported(text, "INSERT source other than VALUES"));
    };
    if values.rows.len() != 1 {
        return Err(unsupported(text, "multi-row INSERT"));
    }
    let row = values.rows.into_iter().next().unwrap_or_default();
    let values = row
        .into_iter()
        .map(|expr| convert_operand(text, expr, params))
        .collect::<Result<Vec<_>>>()?;
    Ok(Command::Insert {
        table,
        columns,
        values,
    })
}

fn convert_update(
    text: &str,
    table: sql::TableWithJoins,
    assignments: Vec<sql::Assignment>,
    selection: Option<sql::Expr>,
    params: &mut ParamCounter,
) -> Result<Command> {
    let table = table_factor_name(text, table)?;
    let assignments = assignments
        .into_iter()
        .map(|assign| convert_assignment(text, assign, params))
        .collect::<Result<Vec<_>>>()?;
    let predicate = selection
        .map(|expr| convert_predicate(text, expr, params))
        .transpose()?;
    Ok(Command::Update {
        table,
        assignments,
        predicate,
    })
}

fn convert_assignment(
    text: &str,
    assign: sql::Assignment,
    params: &mut ParamCounter,
) -> Result<(String, AssignValue)> {
    let column = match assign.target {
        sql::AssignmentTarget::ColumnName(name) => object_name(text, &name)?,
        other => return Err(unsupported(text, format!("assignment target {other}"))),
    };
    let value = match assign.value {
        sql::Expr::BinaryOp { left, op, right }
            if matches!(
                op,
                sql::BinaryOperator::Plus | sql::BinaryOperator::Minus
            ) =>
        {
            AssignValue::Arith {
                column: column_name(text, *left)?,
                negate: op == sql::BinaryOperator::Minus,
                operand: convert_operand(text, *right, params)?,
            }
        }
        other => AssignValue::Set(convert_operand(text, other, params)?),
    };
    Ok((column, value))
}

fn convert_delete(text: &str, delete: sql::Delete, params: &mut ParamCounter) -> Result<Command> {
    let tables = match delete.from {
        sql::FromTable::WithFromKeyword(tables) | sql::FromTable::WithoutKeyword(tables) => tables,
    };
    let mut tables = tables.into_iter();
    let (Some(relation), None) = (tables.next(), tables.next()) else {
        return Err(unsupported(text, "multi-table DELETE"));
    };
    let table = table_factor_name(text, relation)?;
    let predicate = delete
        .selection
        .map(|expr| convert_predicate(text, expr, params))
        .transpose()?;
    Ok(Command::Delete { table, predicate })
}

fn convert_select(text: &str, query: sql::Query, params: &mut ParamCounter) -> Result<Command> {
    let sql::SetExpr::Select(select) = *query.body else {
        return Err(unsupported(text, "non-SELECT query body"));
    };
    let select = *select;

    let mut from = select.from.into_iter();
    let (Some(relation), None) = (from.next(), from.next()) else {
        return Err(unsupported(text, "multi-table SELECT"));
    };
    let table = table_factor_name(text, relation)?;

    let mut wildcard = false;
    let mut names = Vec::new();
    for item in select.projection {
        match item {
            sql::SelectItem::Wildcard(_) => wildcard = true,
            sql::SelectItem::UnnamedExpr(expr) => names.push(column_name(text, expr)?),
            other => return Err(unsupported(text, format!("projection {other}"))),
        }
    }
    let projection = if wildcard {
        if !names.is_empty() {
            return Err(unsupported(text, "mixed wildcard projection"));
        }
        Projection::All
    } else {
        Projection::Columns(names)
    };

    let predicate = select
        .selection
        .map(|expr| convert_predicate(text, expr, params))
        .transpose()?;

    let order_by = match query.order_by {
        None => Vec::new(),
        Some(order) => match order.kind {
            sql::OrderByKind::Expressions(exprs) => exprs
                .into_iter()
                .map(|item| {
                    let column = column_name(text, item.expr)?;
                    let descending = item.options.asc == Some(false);
                    Ok((column, descending))
                })
                .collect::<Result<Vec<_>>>()?,
            sql::OrderByKind::All(_) => {
                return Err(unsupported(text, "ORDER BY ALL"));
            }
        },
    };

    let for_update = query
        .locks
        .iter()
        .any(|lock| matches!(lock.lock_type, sql::LockType::Update));

    Ok(Command::Select {
        table,
        projection,
        predicate,
        order_by,
        for_update,
    })
}

fn convert_predicate(
    text: &str,
    expr: sql::Expr,
    params: &mut ParamCounter,
) -> Result<Predicate> {
    match expr {
        sql::Expr::Nested(inner) => convert_predicate(text, *inner, params),
        sql::Expr::BinaryOp { left, op, right } => match op {
            sql::BinaryOperator::And => Ok(Predicate::And(
                Box::new(convert_predicate(text, *left, params)?),
                Box::new(convert_predicate(text, *right, params)?),
            )),
            sql::BinaryOperator::Or => Ok(Predicate::Or(
                Box::new(convert_predicate(text, *left, params)?),
                Box::new(convert_predicate(text, *right, params)?),
            )),
            _ => {
                let op = match op {
                    sql::BinaryOperator::Eq => CmpOp::Eq,
                    sql::BinaryOperator::NotEq => CmpOp::NotEq,
                    sql::BinaryOperator::Lt => CmpOp::Lt,
                    sql::BinaryOperator::LtEq => CmpOp::LtEq,
                    sql::BinaryOperator::Gt => CmpOp::Gt,
                    sql::BinaryOperator::GtEq => CmpOp::GtEq,
                    other => return Err(unsupported(text, format!("operator {other}"))),
                };
                Ok(Predicate::Compare {
                    column: column_name(text, *left)?,
                    op,
                    operand: convert_operand(text, *right, params)?,
                })
            }
        },
        sql::Expr::InList {
            expr,
            list,
            negated,
        } => Ok(Predicate::In {
            column: column_name(text, *expr)?,
            list: list
                .into_iter()
                .map(|item| convert_operand(text, item, params))
                .collect::<Result<Vec<_>>>()?,
            negated,
        }),
        sql::Expr::IsNull(inner) => Ok(Predicate::IsNull {
            column: column_name(text, *inner)?,
            negated: false,
        }),
        sql::Expr::IsNotNull(inner) => Ok(Predicate::IsNull {
            column: column_name(text, *inner)?,
            negated: true,
        }),
        other => Err(unsupported(text, format!("predicate {other}"))),
    }
}

fn convert_operand(text: &str, expr: sql::Expr, params: &mut ParamCounter) -> Result<Operand> {
    match expr {
        sql::Expr::Nested(inner) => convert_operand(text, *inner, params),
        sql::Expr::Value(v) => match v.value {
            sql::Value::Placeholder(_) => Ok(Operand::Param(params.take())),
            other => Ok(Operand::Literal(literal_value(text, &other)?)),
        },
        sql::Expr::UnaryOp {
            op: sql::UnaryOperator::Minus,
            expr,
        } => match convert_operand(text, *expr, params)? {
            Operand::Literal(Value::BigInt(n)) => Ok(Operand::Literal(Value::BigInt(-n))),
            Operand::Literal(Value::Double(d)) => Ok(Operand::Literal(Value::Double(-d))),
            _ => Err(unsupported(text, "negation of a non-numeric literal")),
        },
        other => Err(unsupported(text, format!("expression {other}"))),
    }
}

fn literal_value(text: &str, value: &sql::Value) -> Result<Value> {
    match value {
        sql::Value::Number(n, _) => {
            if let Ok(i) = n.parse::<i64>() {
                Ok(Value::BigInt(i))
            } else if let Ok(f) = n.parse::<f64>() {
                Ok(Value::Double(f))
            } else {
                Err(syntax(text, format!("bad numeric literal {n}")))
            }
        }
        sql::Value::SingleQuotedString(s) | sql::Value::DoubleQuotedString(s) => {
            Ok(Value::Text(s.clone()))
        }
        sql::Value::Boolean(b) => Ok(Value::Bool(*b)),
        sql::Value::Null => Ok(Value::Null),
        other => Err(unsupported(text, format!("literal {other}"))),
    }
}

fn column_name(text: &str, expr: sql::Expr) -> Result<String> {
    match expr {
        sql::Expr::Identifier(ident) => Ok(ident.value),
        sql::Expr::CompoundIdentifier(parts) => parts
            .into_iter()
            .next_back()
            .map(|ident| ident.value)
            .ok_or_else(|| syntax(text, "empty column reference")),
        other => Err(unsupported(text, format!("column reference {other}"))),
    }
}

fn table_factor_name(text: &str, table: sql::TableWithJoins) -> Result<String> {
    if !table.joins.is_empty() {
        return Err(unsupported(text, "JOIN"));
    }
    match table.relation {
        sql::TableFactor::Table { name, .. } => object_name(text, &name),
        other => Err(unsupported(text, format!("table reference {other}"))),
    }
}

fn object_name(text: &str, name: &sql::ObjectName) -> Result<String> {
    name.0
        .last()
        .map(ToString::to_string)
        .ok_or_else(|| syntax(text, "empty object name"))
}
