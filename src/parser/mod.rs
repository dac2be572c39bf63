// SQL front end: enough of `sqlparser`'s AST surface to drive the engine
// façade's `execute`/`query` entry points. No join planner, no CTEs or
// subqueries -- those live outside this crate's scope.

pub mod expression;

use crate::catalog::{Column, DataType as CatalogDataType, IndexKind};
use crate::collation::Collation;
use crate::error::DbError;
use crate::Result;
use expression::{BinaryOperator, Expression, LiteralValue, UnaryOperator};
use sqlparser::ast::{
    self, Expr as SqlExpr, FunctionArg, FunctionArgExpr, FunctionArguments, ObjectType, Query,
    SelectItem as SqlSelectItem, SetExpr, Statement, TableFactor, Value as SqlValue,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

#[derive(Debug, Clone)]
pub struct OrderByClause {
    pub column: String,
    pub ascending: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

#[derive(Debug, Clone)]
pub enum SelectItem {
    Wildcard,
    Column(String),
    Aggregate { func: AggregateFunc, arg: Option<String>, alias: Option<String> },
}

#[derive(Debug, Clone)]
pub struct SelectStatement {
    pub table: String,
    pub projection: Vec<SelectItem>,
    pub filter: Option<Expression>,
    pub group_by: Vec<String>,
    pub having: Option<Expression>,
    pub order_by: Vec<OrderByClause>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

#[derive(Debug, Clone)]
pub enum SqlStatement {
    CreateTable { name: String, columns: Vec<Column> },
    DropTable { name: String },
    AlterTableAddColumn { table: String, column: Column },
    CreateIndex { name: String, table: String, columns: Vec<String>, kind: IndexKind },
    DropIndex { name: String, table: String },
    Insert { table: String, columns: Vec<String>, values: Vec<Vec<Expression>> },
    Update { table: String, assignments: Vec<(String, Expression)>, filter: Option<Expression> },
    Delete { table: String, filter: Option<Expression> },
    Select(SelectStatement),
    Begin,
    Commit,
    Rollback,
}

pub struct SqlParser {
    dialect: GenericDialect,
}

impl SqlParser {
    pub fn new() -> Self {
        Self { dialect: GenericDialect {} }
    }

    pub fn parse(&self, sql: &str) -> Result<Vec<SqlStatement>> {
        let ast = Parser::parse_sql(&self.dialect, sql).map_err(|e| DbError::ParseError(e.to_string()))?;
        ast.into_iter().map(|stmt| self.convert_statement(stmt)).collect()
    }

    fn convert_statement(&self, stmt: Statement) -> Result<SqlStatement> {
        match stmt {
            Statement::CreateTable(create) => {
                let columns = create.columns.into_iter().map(convert_column_def).collect::<Result<Vec<_>>>()?;
                Ok(SqlStatement::CreateTable { name: create.name.to_string(), columns })
            }
            Statement::Drop { object_type: ObjectType::Table, names, .. } => {
                let name = names.first().ok_or_else(|| DbError::ParseError("DROP TABLE needs a name".to_string()))?;
                Ok(SqlStatement::DropTable { name: name.to_string() })
            }
            Statement::Drop { object_type: ObjectType::Index, names, .. } => {
                let name = names.first().ok_or_else(|| DbError::ParseError("DROP INDEX needs a name".to_string()))?;
                let full = name.to_string();
                let (table, index) = full
                    .split_once('.')
                    .ok_or_else(|| DbError::ParseError("DROP INDEX expects table.index".to_string()))?;
                Ok(SqlStatement::DropIndex { name: index.to_string(), table: table.to_string() })
            }
            Statement::Drop { object_type, .. } => {
                Err(DbError::ParseError(format!("unsupported DROP target {object_type:?}")))
            }
            Statement::AlterTable { name, operations, .. } => {
                let table = name.to_string();
                let op = operations
                    .into_iter()
                    .next()
                    .ok_or_else(|| DbError::ParseError("ALTER TABLE needs an operation".to_string()))?;
                match op {
                    ast::AlterTableOperation::AddColumn { column_def, .. } => {
                        Ok(SqlStatement::AlterTableAddColumn { table, column: convert_column_def(column_def)? })
                    }
                    other => Err(DbError::ParseError(format!("unsupported ALTER TABLE operation {other:?}"))),
                }
            }
            Statement::CreateIndex(create_index) => {
                let kind = match create_index.using.as_ref().map(|u| u.to_string().to_uppercase()) {
                    None => IndexKind::BTree,
                    Some(ref u) if u == "HASH" => IndexKind::Hash,
                    Some(ref u) if u == "BTREE" => IndexKind::BTree,
                    Some(other) => return Err(DbError::ParseError(format!("unknown index method {other}"))),
                };
                let name = create_index
                    .name
                    .ok_or_else(|| DbError::ParseError("CREATE INDEX needs a name".to_string()))?
                    .to_string();
                let columns = create_index.columns.into_iter().map(|c| c.expr.to_string()).collect();
                Ok(SqlStatement::CreateIndex { name, table: create_index.table_name.to_string(), columns, kind })
            }
            Statement::Query(query) => Ok(SqlStatement::Select(convert_select(*query)?)),
            Statement::Insert(insert) => {
                let table = insert.table.to_string();
                let columns = insert.columns.iter().map(|c| c.to_string()).collect();
                let values = match insert.source.map(|s| *s.body) {
                    Some(SetExpr::Values(values)) => values
                        .rows
                        .into_iter()
                        .map(|row| row.iter().map(convert_expr).collect::<Result<Vec<_>>>())
                        .collect::<Result<Vec<_>>>()?,
                    _ => return Err(DbError::ParseError("INSERT requires a VALUES list".to_string())),
                };
                Ok(SqlStatement::Insert { table, columns, values })
            }
            Statement::Update { table, assignments, selection, .. } => {
                let table_name = match &table.relation {
                    TableFactor::Table { name, .. } => name.to_string(),
                    other => return Err(DbError::ParseError(format!("unsupported UPDATE target {other:?}"))),
                };
                let assignments = assignments
                    .into_iter()
                    .map(|a| Ok((a.target.to_string(), convert_expr(&a.value)?)))
                    .collect::<Result<Vec<_>>>()?;
                let filter = selection.as_ref().map(convert_expr).transpose()?;
                Ok(SqlStatement::Update { table: table_name, assignments, filter })
            }
            Statement::Delete(delete) => {
                let table_name = delete
                    .from
                    .first()
                    .and_then(|t| match &t.relation {
                        TableFactor::Table { name, .. } => Some(name.to_string()),
                        _ => None,
                    })
                    .ok_or_else(|| DbError::ParseError("DELETE needs a target table".to_string()))?;
                let filter = delete.selection.as_ref().map(convert_expr).transpose()?;
                Ok(SqlStatement::Delete { table: table_name, filter })
            }
            Statement::StartTransaction { .. } => Ok(SqlStatement::Begin),
            Statement::Commit { .. } => Ok(SqlStatement::Commit),
            Statement::Rollback { .. } => Ok(SqlStatement::Rollback),
            other => Err(DbError::ParseError(format!("unsupported statement: {other}"))),
        }
    }
}

impl Default for SqlParser {
    fn default() -> Self {
        Self::new()
    }
}

fn convert_column_def(col: ast::ColumnDef) -> Result<Column> {
    let data_type = convert_data_type(&col.data_type)?;
    let not_null = col.options.iter().any(|opt| matches!(opt.option, ast::ColumnOption::NotNull));
    let default = col.options.iter().find_map(|opt| match &opt.option {
        ast::ColumnOption::Default(expr) => Some(expr.to_string()),
        _ => None,
    });
    let collation = col.collation.as_ref().map(|c| parse_collation(&c.to_string())).transpose()?;

    let mut column = Column::new(col.name.to_string(), data_type);
    if not_null {
        column = column.not_null();
    }
    if let Some(default) = default {
        column = column.with_default(default);
    }
    if let Some(collation) = collation {
        column = column.with_collation(collation);
    }
    Ok(column)
}

/// Maps the `COLLATE` identifier onto a `Collation`. `LOCALE("<tag>")` comes
/// through as a single identifier the parser hasn't split on quotes, so the
/// tag is pulled out by hand.
fn parse_collation(name: &str) -> Result<Collation> {
    let upper = name.to_ascii_uppercase();
    match upper.as_str() {
        "BINARY" => Ok(Collation::Binary),
        "NOCASE" => Ok(Collation::AsciiCaseInsensitive),
        "RTRIM" => Ok(Collation::RightTrimSpaces),
        "UNICODE" => Ok(Collation::UnicodeCaseAccentInsensitive),
        _ if upper.starts_with("LOCALE(") && upper.ends_with(')') => {
            let inner = &name[7..name.len() - 1];
            let tag = inner.trim_matches(|c| c == '"' || c == '\'');
            Collation::locale(tag)
        }
        _ => Err(DbError::SchemaError(format!("unknown collation '{name}'"))),
    }
}

fn convert_data_type(dt: &ast::DataType) -> Result<CatalogDataType> {
    use ast::DataType as SqlType;
    Ok(match dt {
        SqlType::Int(_) | SqlType::Integer(_) => CatalogDataType::Integer,
        SqlType::BigInt(_) => CatalogDataType::BigInt,
        SqlType::Float(_) => CatalogDataType::Float,
        SqlType::Double | SqlType::DoublePrecision => CatalogDataType::Double,
        SqlType::Decimal(_) | SqlType::Numeric(_) => CatalogDataType::Decimal,
        SqlType::Varchar(len) | SqlType::CharVarying(len) => {
            let size = len
                .map(|l| match l {
                    ast::CharacterLength::IntegerLength { length, .. } => length as u32,
                    ast::CharacterLength::Max => u32::MAX,
                })
                .unwrap_or(255);
            CatalogDataType::Varchar(size)
        }
        SqlType::Text | SqlType::String(_) => CatalogDataType::Text,
        SqlType::Blob(_) | SqlType::Bytea | SqlType::Binary(_) | SqlType::Varbinary(_) => CatalogDataType::Blob,
        SqlType::Boolean | SqlType::Bool => CatalogDataType::Boolean,
        SqlType::Date => CatalogDataType::Date,
        SqlType::Timestamp(..) => CatalogDataType::Timestamp,
        SqlType::Uuid => CatalogDataType::Uuid,
        other => return Err(DbError::ParseError(format!("unsupported column type {other}"))),
    })
}

fn convert_select(query: Query) -> Result<SelectStatement> {
    let SetExpr::Select(select) = *query.body else {
        return Err(DbError::ParseError("only simple SELECT is supported".to_string()));
    };

    if select.from.len() > 1 || select.from.first().map(|f| !f.joins.is_empty()).unwrap_or(false) {
        return Err(DbError::ParseError("joins are not supported".to_string()));
    }
    let table = select
        .from
        .first()
        .and_then(|t| match &t.relation {
            TableFactor::Table { name, .. } => Some(name.to_string()),
            _ => None,
        })
        .ok_or_else(|| DbError::ParseError("SELECT needs a FROM table".to_string()))?;

    let projection = select.projection.into_iter().map(convert_select_item).collect::<Result<Vec<_>>>()?;
    let filter = select.selection.as_ref().map(convert_expr).transpose()?;
    let group_by = match &select.group_by {
        ast::GroupByExpr::Expressions(exprs, _) => exprs.iter().map(|e| e.to_string()).collect(),
        ast::GroupByExpr::All(_) => Vec::new(),
    };
    let having = select.having.as_ref().map(convert_expr).transpose()?;

    let order_by = query
        .order_by
        .map(|o| {
            o.exprs
                .into_iter()
                .map(|ob| OrderByClause { column: ob.expr.to_string(), ascending: ob.asc.unwrap_or(true) })
                .collect()
        })
        .unwrap_or_default();

    let limit = match query.limit {
        Some(SqlExpr::Value(v)) => sql_value_to_u64(&v.value),
        _ => None,
    };
    let offset = query.offset.and_then(|o| match o.value {
        SqlExpr::Value(v) => sql_value_to_u64(&v.value),
        _ => None,
    });

    Ok(SelectStatement { table, projection, filter, group_by, having, order_by, limit, offset })
}

fn sql_value_to_u64(v: &SqlValue) -> Option<u64> {
    match v {
        SqlValue::Number(n, _) => n.parse().ok(),
        _ => None,
    }
}

fn convert_select_item(item: SqlSelectItem) -> Result<SelectItem> {
    match item {
        SqlSelectItem::Wildcard(_) => Ok(SelectItem::Wildcard),
        SqlSelectItem::UnnamedExpr(SqlExpr::Identifier(ident)) => Ok(SelectItem::Column(ident.to_string())),
        SqlSelectItem::UnnamedExpr(SqlExpr::CompoundIdentifier(parts)) => {
            Ok(SelectItem::Column(parts.last().map(|p| p.to_string()).unwrap_or_default()))
        }
        SqlSelectItem::UnnamedExpr(SqlExpr::Function(func)) => convert_aggregate(func, None),
        SqlSelectItem::ExprWithAlias { expr: SqlExpr::Function(func), alias } => convert_aggregate(func, Some(alias)),
        SqlSelectItem::ExprWithAlias { expr: SqlExpr::Identifier(ident), alias } => {
            Ok(SelectItem::Column(format!("{ident} AS {alias}")))
        }
        other => Err(DbError::ParseError(format!("unsupported projection item {other:?}"))),
    }
}

fn convert_aggregate(func: ast::Function, alias: Option<ast::Ident>) -> Result<SelectItem> {
    let name = func.name.to_string().to_uppercase();
    let agg = match name.as_str() {
        "COUNT" => AggregateFunc::Count,
        "SUM" => AggregateFunc::Sum,
        "AVG" => AggregateFunc::Avg,
        "MIN" => AggregateFunc::Min,
        "MAX" => AggregateFunc::Max,
        other => return Err(DbError::ParseError(format!("unsupported function {other}"))),
    };
    let arg = match func.args {
        FunctionArguments::List(list) => list.args.into_iter().find_map(|a| match a {
            FunctionArg::Unnamed(FunctionArgExpr::Expr(SqlExpr::Identifier(ident))) => Some(ident.to_string()),
            _ => None,
        }),
        _ => None,
    };
    Ok(SelectItem::Aggregate { func: agg, arg, alias: alias.map(|a| a.to_string()) })
}

fn convert_expr(expr: &SqlExpr) -> Result<Expression> {
    Ok(match expr {
        SqlExpr::Identifier(ident) => Expression::Column(ident.to_string()),
        SqlExpr::CompoundIdentifier(parts) => Expression::Column(parts.last().map(|p| p.to_string()).unwrap_or_default()),
        SqlExpr::Value(v) => Expression::Literal(convert_literal(&v.value)?),
        SqlExpr::BinaryOp { left, op, right } => Expression::BinaryOp {
            left: Box::new(convert_expr(left)?),
            op: convert_binary_op(op)?,
            right: Box::new(convert_expr(right)?),
        },
        SqlExpr::UnaryOp { op, expr } => Expression::UnaryOp { op: convert_unary_op(op)?, expr: Box::new(convert_expr(expr)?) },
        SqlExpr::Between { expr, negated, low, high } => Expression::Between {
            expr: Box::new(convert_expr(expr)?),
            low: Box::new(convert_expr(low)?),
            high: Box::new(convert_expr(high)?),
            negated: *negated,
        },
        SqlExpr::InList { expr, list, negated } => Expression::In {
            expr: Box::new(convert_expr(expr)?),
            list: list.iter().map(convert_expr).collect::<Result<Vec<_>>>()?,
            negated: *negated,
        },
        SqlExpr::IsNull(inner) => Expression::IsNull { expr: Box::new(convert_expr(inner)?), negated: false },
        SqlExpr::IsNotNull(inner) => Expression::IsNull { expr: Box::new(convert_expr(inner)?), negated: true },
        SqlExpr::Like { expr, pattern, negated, escape_char, .. } => Expression::Like {
            expr: Box::new(convert_expr(expr)?),
            pattern: Box::new(convert_expr(pattern)?),
            escape: escape_char.map(|c| Box::new(Expression::Literal(LiteralValue::String(c.to_string())))),
            negated: *negated,
        },
        SqlExpr::Nested(inner) => convert_expr(inner)?,
        SqlExpr::Function(func) => {
            let name = func.name.to_string();
            let args = match &func.args {
                FunctionArguments::List(list) => list
                    .args
                    .iter()
                    .filter_map(|a| match a {
                        FunctionArg::Unnamed(FunctionArgExpr::Expr(e)) => Some(convert_expr(e)),
                        _ => None,
                    })
                    .collect::<Result<Vec<_>>>()?,
                _ => Vec::new(),
            };
            Expression::Function { name, args }
        }
        other => return Err(DbError::ParseError(format!("unsupported expression {other}"))),
    })
}

fn convert_literal(v: &SqlValue) -> Result<LiteralValue> {
    Ok(match v {
        SqlValue::Null => LiteralValue::Null,
        SqlValue::Boolean(b) => LiteralValue::Boolean(*b),
        SqlValue::Number(n, _) => {
            if let Ok(i) = n.parse::<i64>() {
                LiteralValue::Integer(i)
            } else {
                LiteralValue::Float(n.parse().map_err(|_| DbError::ParseError(format!("bad numeric literal {n}")))?)
            }
        }
        SqlValue::SingleQuotedString(s) | SqlValue::DoubleQuotedString(s) => LiteralValue::String(s.clone()),
        SqlValue::Placeholder(marker) => LiteralValue::String(marker.clone()),
        other => return Err(DbError::ParseError(format!("unsupported literal {other}"))),
    })
}

fn convert_binary_op(op: &ast::BinaryOperator) -> Result<BinaryOperator> {
    use ast::BinaryOperator as Op;
    Ok(match op {
        Op::Plus => BinaryOperator::Add,
        Op::Minus => BinaryOperator::Subtract,
        Op::Multiply => BinaryOperator::Multiply,
        Op::Divide => BinaryOperator::Divide,
        Op::Modulo => BinaryOperator::Modulo,
        Op::Eq => BinaryOperator::Equal,
        Op::NotEq => BinaryOperator::NotEqual,
        Op::Lt => BinaryOperator::LessThan,
        Op::LtEq => BinaryOperator::LessThanOrEqual,
        Op::Gt => BinaryOperator::GreaterThan,
        Op::GtEq => BinaryOperator::GreaterThanOrEqual,
        Op::And => BinaryOperator::And,
        Op::Or => BinaryOperator::Or,
        Op::StringConcat => BinaryOperator::Concat,
        other => return Err(DbError::ParseError(format!("unsupported operator {other}"))),
    })
}

fn convert_unary_op(op: &ast::UnaryOperator) -> Result<UnaryOperator> {
    use ast::UnaryOperator as Op;
    Ok(match op {
        Op::Not => UnaryOperator::Not,
        Op::Minus => UnaryOperator::Negate,
        Op::Plus => UnaryOperator::Plus,
        other => return Err(DbError::ParseError(format!("unsupported unary operator {other}"))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_create_table_with_collation() {
        let parser = SqlParser::new();
        let stmts = parser.parse("CREATE TABLE users (id INT, name VARCHAR(255) COLLATE NOCASE)").unwrap();
        match &stmts[0] {
            SqlStatement::CreateTable { name, columns } => {
                assert_eq!(name, "users");
                assert_eq!(columns.len(), 2);
                assert_eq!(columns[1].collation, Some(Collation::AsciiCaseInsensitive));
            }
            _ => panic!("expected CreateTable"),
        }
    }

    #[test]
    fn parses_select_with_where_and_limit() {
        let parser = SqlParser::new();
        let stmts = parser.parse("SELECT id, name FROM users WHERE id > 5 ORDER BY name LIMIT 10").unwrap();
        match &stmts[0] {
            SqlStatement::Select(select) => {
                assert_eq!(select.table, "users");
                assert_eq!(select.projection.len(), 2);
                assert!(select.filter.is_some());
                assert_eq!(select.limit, Some(10));
            }
            _ => panic!("expected Select"),
        }
    }

    #[test]
    fn parses_insert_values() {
        let parser = SqlParser::new();
        let stmts = parser.parse("INSERT INTO users (id, name) VALUES (1, 'Ada')").unwrap();
        match &stmts[0] {
            SqlStatement::Insert { table, columns, values } => {
                assert_eq!(table, "users");
                assert_eq!(columns.len(), 2);
                assert_eq!(values.len(), 1);
            }
            _ => panic!("expected Insert"),
        }
    }

    #[test]
    fn parses_create_index_using_hash() {
        let parser = SqlParser::new();
        let stmts = parser.parse("CREATE INDEX by_name ON users USING HASH (name)").unwrap();
        match &stmts[0] {
            SqlStatement::CreateIndex { name, table, kind, .. } => {
                assert_eq!(name, "by_name");
                assert_eq!(table, "users");
                assert_eq!(*kind, IndexKind::Hash);
            }
            _ => panic!("expected CreateIndex"),
        }
    }

    #[test]
    fn parses_transaction_control() {
        let parser = SqlParser::new();
        assert!(matches!(parser.parse("BEGIN").unwrap()[0], SqlStatement::Begin));
        assert!(matches!(parser.parse("COMMIT").unwrap()[0], SqlStatement::Commit));
        assert!(matches!(parser.parse("ROLLBACK").unwrap()[0], SqlStatement::Rollback));
    }
}
