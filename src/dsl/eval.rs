use std::collections::{HashMap, HashSet};

use serde_json::Value as Json;

use super::aggr;
use super::parser::parse;
use super::stmt::{Expr, Operation, Plan, Statement};
use super::value::Value;
use super::CancelFlag;
use crate::db::Db;
use crate::error::{DbError, DbResult};
use crate::store::ops::stringify_value;
use crate::store::{Relation, Row};

/// Register-machine executor: a program counter walks the statement list
/// and a memory map from statement name to narrowed value holds the
/// intermediates. Filters and projections re-enter their statement
/// subranges per row by snapshotting and restoring the counter.
pub struct Evaluator<'a> {
    db: &'a Db,
    plan: &'a Plan,
    password: &'a str,
    ctx_key: String,
    ctx_values: Vec<String>,
    cancel: CancelFlag,
    memory: HashMap<String, Value>,
    pos: usize,
}

impl<'a> Evaluator<'a> {
    pub fn new(
        db: &'a Db,
        plan: &'a Plan,
        password: &'a str,
        ctx_key: impl Into<String>,
        ctx_values: Vec<String>,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            db,
            plan,
            password,
            ctx_key: ctx_key.into(),
            ctx_values,
            cancel,
            memory: HashMap::new(),
            pos: 0,
        }
    }

    pub fn eval(&mut self) -> DbResult<Value> {
        while self.pos < self.plan.statements.len() {
            self.eval_statement()?;
        }
        Ok(self
            .plan
            .statements
            .last()
            .and_then(|s| self.memory.get(&s.name))
            .cloned()
            .unwrap_or(Value::Null))
    }

    /// Read access to memory for assertions on intermediate statements.
    pub fn memory(&self) -> &HashMap<String, Value> {
        &self.memory
    }

    fn set(&mut self, name: &str, value: Value) {
        self.memory.insert(name.to_string(), value);
    }

    fn get_memory(&self, name: &str) -> DbResult<&Value> {
        self.memory
            .get(name)
            .ok_or_else(|| DbError::Internal(format!("unresolved variable '{}'", name)))
    }

    fn eval_statement(&mut self) -> DbResult<()> {
        if self.cancel.is_cancelled() {
            return Err(DbError::Timeout);
        }
        let op = self.plan.statements[self.pos].op;
        match op {
            Operation::AccessTable => self.eval_table(),
            Operation::AccessRelatedTable => self.eval_related_table(),
            Operation::AccessList => self.eval_table_list(),
            Operation::AccessRow => self.eval_table_row(),
            Operation::AccessField => self.eval_table_field(),
            Operation::AccessJsonProperty => self.eval_property(false),
            Operation::UnknownIdentifier => self.eval_property(true),
            Operation::Slice => self.eval_slice(),
            Operation::Literal => self.eval_literal(),
            Operation::Operator => self.eval_operator(),
            Operation::StartFilter => self.eval_filter(),
            Operation::StartProjection => self.eval_projection(),
            Operation::Aggregate => self.eval_aggr(),
            other => Err(DbError::Internal(format!(
                "unexpected {} statement outside its block",
                other.tag()
            ))),
        }
    }

    // ===== Scope checks =====

    /// True when a statement executes against a single bound row, i.e. its
    /// dependency is an open filter or projection scope.
    fn under_row_scope(&self, stmt: &Statement) -> bool {
        let dep = match stmt.op {
            Operation::AccessRelatedTable => stmt.sources.get(1),
            _ => stmt.sources.first(),
        };
        dep.and_then(|s| self.plan.by_name(&s.value))
            .map(|parent| {
                matches!(
                    parent.op,
                    Operation::StartFilter
                        | Operation::StartProjection
                        | Operation::StartProjectionKey
                )
            })
            .unwrap_or(false)
    }

    // ===== Tables =====

    fn eval_table(&mut self) -> DbResult<()> {
        let stmt = self.plan.statements[self.pos].clone();

        // A context snippet declared on the entity replaces the plain
        // table fetch when the request carries its key.
        if !self.ctx_key.is_empty() {
            let entity_alias = stmt.sources[0]
                .value
                .split_once('.')
                .map(|(_, t)| t.to_string())
                .unwrap_or_default();
            let ctx_query = self
                .db
                .proto_context(self.password, &entity_alias, &self.ctx_key)?;
            if !ctx_query.is_empty() {
                let substituted = substitute_context(&ctx_query, &self.ctx_values);
                let plan = parse(self.db, self.password, &substituted)?;
                let mut sub = Evaluator::new(
                    self.db,
                    &plan,
                    self.password,
                    "",
                    Vec::new(),
                    self.cancel.clone(),
                );
                let result = sub.eval()?;
                self.set(&stmt.name, result);
                self.pos += 1;
                return Ok(());
            }
        }

        let db_name = stmt.meta_str("db").to_string();
        let table_name = stmt.meta_str("table").to_string();

        // If the statement is immediately followed by a filter made of
        // equality tests joined by and/or, resolve it through the indices
        // and materialize only the selected PKs. The filter still runs
        // row-by-row afterwards.
        let rows = match self.indexable_filter(self.pos + 1) {
            Some(filters) if !filters.is_empty() => {
                self.rows_by_index_filters(&db_name, &table_name, &filters)?
            }
            _ => {
                let pks = self.db.all_pks(&db_name, &table_name)?;
                self.db.rows_by_pks(&db_name, &table_name, &pks)?
            }
        };

        self.set(&stmt.name, Value::Table(rows));
        self.pos += 1;
        Ok(())
    }

    /// Scans the statements of a directly following filter block. Returns
    /// a postfix token list of `(column, value)` equality predicates and
    /// and/or connectives, or None when the filter cannot be answered from
    /// the indices.
    fn indexable_filter(&self, start: usize) -> Option<Vec<FilterToken>> {
        if self
            .plan
            .statements
            .get(start)
            .map(|s| s.op)
            != Some(Operation::StartFilter)
        {
            return None;
        }

        let mut tokens = Vec::new();
        let mut col: Option<String> = None;
        let mut val: Option<String> = None;

        let mut i = start + 1;
        while let Some(stmt) = self.plan.statements.get(i) {
            match stmt.op {
                Operation::EndFilter => {
                    if let (Some(c), Some(v)) = (col.take(), val.take()) {
                        tokens.push(FilterToken::Predicate(c, v));
                    }
                    return Some(tokens);
                }
                Operation::AccessList => {
                    col = Some(stmt.meta_str("name").to_string());
                }
                Operation::Literal => {
                    val = stmt.expr.text().map(str::to_string);
                }
                Operation::Operator => {
                    let text = stmt.expr.text()?;
                    let op = text.split(' ').nth(1)?.to_lowercase();
                    match op.as_str() {
                        "=" => {}
                        "and" | "or" => {
                            if let (Some(c), Some(v)) = (col.take(), val.take()) {
                                tokens.push(FilterToken::Predicate(c, v));
                            }
                            tokens.push(FilterToken::Connective(op == "and"));
                        }
                        _ => return None,
                    }
                }
                _ => return None,
            }
            if col.is_some() && val.is_some() {
                tokens.push(FilterToken::Predicate(col.take().unwrap(), val.take().unwrap()));
            }
            i += 1;
        }
        None
    }

    /// Postfix evaluation over PK sets: predicates push, connectives pop
    /// two and combine by intersection (and) or union (or).
    fn rows_by_index_filters(
        &self,
        db_name: &str,
        table_name: &str,
        filters: &[FilterToken],
    ) -> DbResult<Vec<Row>> {
        let mut stack: Vec<Vec<String>> = Vec::new();

        for token in filters {
            match token {
                FilterToken::Predicate(col, value) => {
                    let pks = self.db.pks_by_index(db_name, table_name, col, value)?;
                    stack.push(dedupe(pks));
                }
                FilterToken::Connective(and) => {
                    let right = stack.pop();
                    let left = stack.pop();
                    let (left, right) = match (left, right) {
                        (Some(l), Some(r)) => (l, r),
                        _ => {
                            return Err(DbError::Internal(
                                "filter connective without two operands".to_string(),
                            ))
                        }
                    };
                    let merged = if *and {
                        intersect(&left, &right)
                    } else {
                        union(&left, &right)
                    };
                    stack.push(merged);
                }
            }
        }

        match stack.len() {
            0 => Ok(Vec::new()),
            1 => self.db.rows_by_pks(db_name, table_name, &stack[0]),
            _ => Err(DbError::Internal(
                "incomplete filter: uncombined expressions".to_string(),
            )),
        }
    }

    fn eval_related_table(&mut self) -> DbResult<()> {
        let stmt = self.plan.statements[self.pos].clone();
        self.pos += 1;

        let relation = match &stmt.expr {
            Expr::Relation(r) => r.clone(),
            _ => return Err(DbError::Internal("relation payload missing".to_string())),
        };
        let fk_cols: Vec<String> = relation.fkfield.split(':').map(str::to_string).collect();
        if fk_cols.len() < 2 {
            return Err(DbError::ProtocolViolation(format!(
                "invalid FK field '{}'",
                relation.fkfield
            )));
        }
        let local_col = &fk_cols[0];
        let host_db = stmt.meta_str("db").to_string();

        let source = self.get_memory(&stmt.sources[1].value)?.clone();
        let mut result: Vec<Row> = Vec::new();

        if self.under_row_scope(&stmt) {
            let row = source.as_row().ok_or_else(|| {
                DbError::TypeMismatch("host row not found for relation traversal".to_string())
            })?;
            if let Some(fk) = row.get(local_col) {
                result.extend(self.fetch_related(&relation, &fk_cols, &host_db, &stringify_value(fk))?);
            }
        } else {
            let table = source.as_table().ok_or_else(|| {
                DbError::TypeMismatch("host table not found for relation traversal".to_string())
            })?;
            for row in table {
                if let Some(fk) = row.get(local_col) {
                    result.extend(self.fetch_related(
                        &relation,
                        &fk_cols,
                        &host_db,
                        &stringify_value(fk),
                    )?);
                }
            }
        }

        self.set(&stmt.name, Value::Table(result));
        Ok(())
    }

    /// One relation hop for a single FK value. `mtm` routes through the
    /// join table; everything else is a single indexed lookup into the
    /// target entity.
    fn fetch_related(
        &self,
        relation: &Relation,
        fk_cols: &[String],
        host_db: &str,
        value: &str,
    ) -> DbResult<Vec<Row>> {
        let (target_db, target_table) =
            self.db.store().resolve_entity(self.password, &relation.entity)?;

        if relation.kind == "mtm" {
            if fk_cols.len() != 4 {
                return Err(DbError::ProtocolViolation(format!(
                    "mtm relation expects 'local:throughLocal:throughRemote:remote', got '{}'",
                    relation.fkfield
                )));
            }
            let join_pks = self
                .db
                .pks_by_index(host_db, &relation.through, &fk_cols[1], value)?;
            let join_rows = self.db.rows_by_pks(host_db, &relation.through, &join_pks)?;

            let mut pks = Vec::new();
            for join_row in &join_rows {
                if let Some(remote_value) = join_row.get(&fk_cols[2]) {
                    pks.extend(self.db.pks_by_index(
                        &target_db,
                        &target_table,
                        &fk_cols[3],
                        &stringify_value(remote_value),
                    )?);
                }
            }
            return self.db.rows_by_pks(&target_db, &target_table, &pks);
        }

        let pks = self
            .db
            .pks_by_index(&target_db, &target_table, &fk_cols[1], value)?;
        self.db.rows_by_pks(&target_db, &target_table, &pks)
    }

    // ===== Lists, rows, fields =====

    fn eval_table_list(&mut self) -> DbResult<()> {
        let stmt = self.plan.statements[self.pos].clone();
        // Inside a filter or projection the same statement reads a field
        // of the bound row instead of extracting a column.
        if self.under_row_scope(&stmt) {
            return self.eval_table_field();
        }
        self.pos += 1;

        let source = self.get_memory(&stmt.sources[0].value)?;
        let rows = source.as_table().ok_or_else(|| {
            DbError::TypeMismatch(format!(
                "expected table for column extraction, got {}",
                source.label()
            ))
        })?;

        let col = stmt.meta_str("name");
        let value = match stmt.meta_str("type") {
            "number" | "timestamp" => {
                let mut out = Vec::new();
                for row in rows {
                    if let Some(cell) = row.get(col) {
                        let f = cell.as_f64().ok_or_else(|| {
                            DbError::TypeMismatch(format!(
                                "column '{}' holds a non-numeric value",
                                col
                            ))
                        })?;
                        out.push(f);
                    }
                }
                Value::NumList(out)
            }
            "string" => {
                let mut out = Vec::new();
                for row in rows {
                    if let Some(cell) = row.get(col) {
                        let s = cell.as_str().ok_or_else(|| {
                            DbError::TypeMismatch(format!(
                                "column '{}' holds a non-string value",
                                col
                            ))
                        })?;
                        out.push(s.to_string());
                    }
                }
                Value::StrList(out)
            }
            _ => Value::List(rows.iter().filter_map(|row| row.get(col).cloned()).collect()),
        };

        self.set(&stmt.name, value);
        Ok(())
    }

    fn eval_table_row(&mut self) -> DbResult<()> {
        let stmt = self.plan.statements[self.pos].clone();
        self.pos += 1;

        let index = match stmt.expr {
            Expr::Index(i) => i,
            _ => return Err(DbError::Internal("row index missing".to_string())),
        };
        let source = self.get_memory(&stmt.sources[0].value)?;
        let elements = source.elements().ok_or_else(|| {
            DbError::TypeMismatch(format!("expected array for row access, got {}", source.label()))
        })?;

        let element = elements
            .get(index as usize)
            .cloned()
            .ok_or_else(|| DbError::InvalidInput(format!("row index {} out of range", index)))?;

        self.set(&stmt.name, Value::from_json(element));
        Ok(())
    }

    fn eval_table_field(&mut self) -> DbResult<()> {
        let stmt = self.plan.statements[self.pos].clone();
        self.pos += 1;

        let source = self.get_memory(&stmt.sources[0].value)?;
        let row = source.as_row().ok_or_else(|| {
            DbError::TypeMismatch(format!("expected row for field access, got {}", source.label()))
        })?;
        let field = row
            .get(stmt.meta_str("name"))
            .cloned()
            .map(Value::from_json)
            .unwrap_or(Value::Null);

        self.set(&stmt.name, field);
        Ok(())
    }

    // ===== Slices and literals =====

    fn eval_slice(&mut self) -> DbResult<()> {
        let stmt = self.plan.statements[self.pos].clone();
        self.pos += 1;

        let spec = stmt.expr.text().unwrap_or_default().to_string();
        let source = self.get_memory(&stmt.sources[0].value)?;
        let elements = source.elements().ok_or_else(|| {
            DbError::TypeMismatch(format!("expected array for slicing, got {}", source.label()))
        })?;
        let len = elements.len() as i64;

        let parts: Vec<&str> = spec.split(':').collect();
        let parse_part = |idx: usize| -> DbResult<Option<i64>> {
            match parts.get(idx) {
                Some(p) if !p.is_empty() => p
                    .parse::<i64>()
                    .map(Some)
                    .map_err(|_| DbError::InvalidInput(format!("invalid slice index '{}'", p))),
                _ => Ok(None),
            }
        };

        let mut start = parse_part(0)?.unwrap_or(0);
        let mut end = parse_part(1)?.unwrap_or(len);
        let mut step = parse_part(2)?.unwrap_or(1);

        if start < 0 {
            start += len;
        }
        if end < 0 {
            end += len;
        }
        if step <= 0 {
            step = 1;
        }
        let start = start.clamp(0, len) as usize;
        let end = end.clamp(0, len) as usize;

        let mut out = Vec::new();
        if start < end {
            let mut i = start;
            while i < end {
                out.push(elements[i].clone());
                i += step as usize;
            }
        }

        self.set(&stmt.name, Value::from_list(out));
        Ok(())
    }

    fn eval_literal(&mut self) -> DbResult<()> {
        let stmt = self.plan.statements[self.pos].clone();
        self.pos += 1;

        let text = stmt.expr.text().unwrap_or_default();
        let value = if stmt.meta_str("type") == "NUMBER" {
            let f: f64 = text
                .parse()
                .map_err(|_| DbError::InvalidInput(format!("invalid number literal '{}'", text)))?;
            Value::Number(f)
        } else {
            Value::Str(text.to_string())
        };

        self.set(&stmt.name, value);
        Ok(())
    }

    // ===== Operators =====

    fn eval_operator(&mut self) -> DbResult<()> {
        let stmt = self.plan.statements[self.pos].clone();
        self.pos += 1;

        let text = stmt.expr.text().unwrap_or_default();
        let parts: Vec<&str> = text.splitn(3, ' ').collect();
        if parts.len() != 3 {
            return Err(DbError::Internal(format!("malformed operator expression '{}'", text)));
        }
        let (left_name, op, right_name) = (parts[0], parts[1].to_lowercase(), parts[2]);

        let result = match op.as_str() {
            "+" | "-" | "*" | "/" | "%" => {
                self.eval_arithmetic(&stmt, left_name, &op, right_name)?
            }
            "=" | "!=" | "<" | "<=" | ">" | ">=" | "in" => {
                self.eval_comparison(&stmt, left_name, &op, right_name)?
            }
            "and" | "or" | "not" => self.eval_logical(left_name, &op, right_name)?,
            other => {
                return Err(DbError::TypeMismatch(format!("unknown operator '{}'", other)))
            }
        };

        self.set(&stmt.name, result);
        Ok(())
    }

    fn operand(&self, name_or_literal: &str, kind: &str) -> DbResult<Operand> {
        if kind == "var" {
            let value = self.get_memory(name_or_literal)?;
            Ok(match value {
                Value::Number(f) => Operand::Num(*f),
                Value::Str(s) => Operand::Str(s.clone()),
                Value::NumList(items) => Operand::NumList(items.clone()),
                Value::StrList(items) => Operand::StrList(items.clone()),
                other => Operand::Other(other.label()),
            })
        } else {
            match kind {
                "STRING" => Ok(Operand::Str(name_or_literal.to_string())),
                "NUMBER" | "TIMESTAMP" => name_or_literal
                    .parse::<f64>()
                    .map(Operand::Num)
                    .map_err(|_| {
                        DbError::TypeMismatch(format!("invalid numeric operand '{}'", name_or_literal))
                    }),
                other => Err(DbError::TypeMismatch(format!(
                    "invalid operand kind '{}'",
                    other
                ))),
            }
        }
    }

    fn eval_arithmetic(
        &self,
        stmt: &Statement,
        left_name: &str,
        op: &str,
        right_name: &str,
    ) -> DbResult<Value> {
        let left = self.operand(left_name, stmt.meta_str("left_type"))?;
        let right = self.operand(right_name, stmt.meta_str("right_type"))?;

        match (left, right) {
            (Operand::Str(a), Operand::Str(b)) => {
                if op == "+" {
                    Ok(Value::Str(format!("{}{}", a, b)))
                } else {
                    Err(DbError::TypeMismatch(format!(
                        "operator '{}' is not defined on strings",
                        op
                    )))
                }
            }
            (Operand::Num(a), Operand::Num(b)) => {
                let result = match op {
                    "+" => a + b,
                    "-" => a - b,
                    "*" => a * b,
                    "/" => a / b,
                    "%" => a % b,
                    _ => unreachable!(),
                };
                Ok(Value::Number(result))
            }
            (left, right) => Err(DbError::TypeMismatch(format!(
                "arithmetic '{}' needs two numbers or two strings, got {} and {}",
                op,
                left.kind(),
                right.kind()
            ))),
        }
    }

    fn eval_comparison(
        &self,
        stmt: &Statement,
        left_name: &str,
        op: &str,
        right_name: &str,
    ) -> DbResult<Value> {
        let left = self.operand(left_name, stmt.meta_str("left_type"))?;
        let right = self.operand(right_name, stmt.meta_str("right_type"))?;

        // Property access on untyped JSON compares as false instead of
        // failing the whole query.
        let untyped_json = |name: &str| {
            self.plan
                .by_name(name)
                .map(|s| {
                    matches!(
                        s.op,
                        Operation::AccessJsonProperty | Operation::UnknownIdentifier
                    )
                })
                .unwrap_or(false)
        };
        if matches!(left, Operand::Other(_)) && untyped_json(left_name) {
            return Ok(Value::Bool(false));
        }
        if matches!(right, Operand::Other(_)) && untyped_json(right_name) {
            return Ok(Value::Bool(false));
        }

        let result = match (&left, &right) {
            (Operand::Str(a), Operand::Str(b)) => match op {
                "=" => a == b,
                "!=" => a != b,
                "<" => a < b,
                "<=" => a <= b,
                ">" => a > b,
                ">=" => a >= b,
                "in" => {
                    return Err(DbError::TypeMismatch(
                        "'in' needs a list on the right-hand side".to_string(),
                    ))
                }
                _ => unreachable!(),
            },
            (Operand::Num(a), Operand::Num(b)) => match op {
                "=" => a == b,
                "!=" => a != b,
                "<" => a < b,
                "<=" => a <= b,
                ">" => a > b,
                ">=" => a >= b,
                "in" => {
                    return Err(DbError::TypeMismatch(
                        "'in' needs a list on the right-hand side".to_string(),
                    ))
                }
                _ => unreachable!(),
            },
            (Operand::Str(a), Operand::StrList(items)) if op == "in" => items.contains(a),
            (Operand::Num(a), Operand::NumList(items)) if op == "in" => items.contains(a),
            _ => {
                return Err(DbError::TypeMismatch(format!(
                    "comparison '{}' on incompatible operands ({} vs {})",
                    op,
                    left.kind(),
                    right.kind()
                )))
            }
        };

        Ok(Value::Bool(result))
    }

    fn eval_logical(&self, left_name: &str, op: &str, right_name: &str) -> DbResult<Value> {
        let right = self
            .get_memory(right_name)?
            .as_bool()
            .ok_or_else(|| DbError::TypeMismatch("logical operand must be a boolean".to_string()))?;

        let result = match op {
            "not" => !right,
            "and" | "or" => {
                let left = self.get_memory(left_name)?.as_bool().ok_or_else(|| {
                    DbError::TypeMismatch("logical operand must be a boolean".to_string())
                })?;
                if op == "and" {
                    left && right
                } else {
                    left || right
                }
            }
            _ => unreachable!(),
        };

        Ok(Value::Bool(result))
    }

    // ===== Filters =====

    fn eval_filter(&mut self) -> DbResult<()> {
        let filter_stmt = self.plan.statements[self.pos].clone();
        self.pos += 1;
        let body_start = self.pos;

        let source = self.get_memory(&filter_stmt.sources[0].value)?;
        let rows = source
            .as_table()
            .cloned()
            .ok_or_else(|| {
                DbError::TypeMismatch(format!("expected table for filter, got {}", source.label()))
            })?;

        let mut kept: Vec<Row> = Vec::new();
        let end_pos;

        if rows.is_empty() {
            end_pos = self.skip_block(body_start, Operation::StartFilter, Operation::EndFilter)?;
        } else {
            let mut found_end = None;
            for row in rows {
                if self.cancel.is_cancelled() {
                    return Err(DbError::Timeout);
                }
                // Bind the current row to the filter's own name so inner
                // statements read it as their row context.
                self.set(&filter_stmt.name, Value::Row(row.clone()));
                self.pos = body_start;

                loop {
                    if self.plan.statements[self.pos].op == Operation::EndFilter {
                        found_end = Some(self.pos);
                        break;
                    }
                    self.eval_statement()?;
                }

                let last_inner = &self.plan.statements[self.pos - 1];
                let keep = self
                    .get_memory(&last_inner.name)?
                    .as_bool()
                    .ok_or_else(|| {
                        DbError::TypeMismatch(
                            "filter expression must produce a boolean".to_string(),
                        )
                    })?;
                if keep {
                    kept.push(row);
                }
            }
            end_pos = found_end.expect("non-empty filter reached its end statement");
        }

        let end_name = self.plan.statements[end_pos].name.clone();
        self.pos = end_pos + 1;
        self.set(&end_name, Value::Table(kept));
        Ok(())
    }

    /// Fast-forwards over a block body, balancing nested opens, and
    /// returns the position of the matching end statement.
    fn skip_block(&self, from: usize, open: Operation, close: Operation) -> DbResult<usize> {
        let mut nested = 0;
        let mut i = from;
        while let Some(stmt) = self.plan.statements.get(i) {
            if stmt.op == open {
                nested += 1;
            } else if stmt.op == close {
                if nested == 0 {
                    return Ok(i);
                }
                nested -= 1;
            }
            i += 1;
        }
        Err(DbError::Internal("unterminated block in statement list".to_string()))
    }

    // ===== Projections =====

    fn eval_projection(&mut self) -> DbResult<()> {
        let proj_stmt = self.plan.statements[self.pos].clone();
        self.pos += 1;
        let body_start = self.pos;

        let source = self.get_memory(&proj_stmt.sources[0].value)?;
        let rows: Vec<Row> = match source {
            Value::Table(rows) => rows.clone(),
            // A slice or filter can leave an empty untyped array.
            Value::List(items) if items.is_empty() => Vec::new(),
            other => {
                return Err(DbError::TypeMismatch(format!(
                    "expected table for projection, got {}",
                    other.label()
                )))
            }
        };

        let mut projected: Vec<Row> = Vec::new();
        let end_pos;

        if rows.is_empty() {
            end_pos =
                self.skip_block(body_start, Operation::StartProjection, Operation::EndProjection)?;
        } else {
            let mut found_end = None;
            for row in rows {
                if self.cancel.is_cancelled() {
                    return Err(DbError::Timeout);
                }
                self.set(&proj_stmt.name, Value::Row(row.clone()));
                let mut object = Row::new();
                self.pos = body_start;

                loop {
                    let stmt = self.plan.statements[self.pos].clone();
                    match stmt.op {
                        Operation::StartProjectionKey => {
                            // Each key's sub-program starts from the row.
                            self.set(&stmt.name, Value::Row(row.clone()));
                            self.pos += 1;
                        }
                        Operation::EndProjectionKey => {
                            let key = stmt.expr.text().unwrap_or_default().to_string();
                            let last_inner = &self.plan.statements[self.pos - 1];
                            let value = self
                                .get_memory(&last_inner.name)?
                                .to_json();
                            object.insert(key, value);
                            self.pos += 1;
                        }
                        Operation::EndProjection => {
                            found_end = Some(self.pos);
                            break;
                        }
                        _ => self.eval_statement()?,
                    }
                }

                projected.push(object);
            }
            end_pos = found_end.expect("non-empty projection reached its end statement");
        }

        let end_name = self.plan.statements[end_pos].name.clone();
        self.pos = end_pos + 1;
        self.set(&end_name, Value::Table(projected));
        Ok(())
    }

    // ===== JSON property access =====

    fn eval_property(&mut self, strict: bool) -> DbResult<()> {
        let stmt = self.plan.statements[self.pos].clone();
        self.pos += 1;

        let prop = stmt.expr.text().unwrap_or_default().to_string();
        let source = self.get_memory(&stmt.sources[0].value)?;

        let value = match source {
            Value::Row(map) => map.get(&prop).cloned().map(Value::from_json).unwrap_or(Value::Null),
            Value::Table(rows) => Value::from_list(
                rows.iter()
                    .map(|row| row.get(&prop).cloned().unwrap_or(Json::Null))
                    .collect(),
            ),
            Value::List(items) => {
                let mut out = Vec::new();
                for item in items {
                    match item {
                        Json::Null => out.push(Json::Null),
                        Json::Object(map) => {
                            out.push(map.get(&prop).cloned().unwrap_or(Json::Null))
                        }
                        other => {
                            if strict {
                                return Err(DbError::TypeMismatch(format!(
                                    "cannot access property '{}' on non-object element {}",
                                    prop, other
                                )));
                            }
                            out.push(Json::Null);
                        }
                    }
                }
                Value::from_list(out)
            }
            other => {
                return Err(DbError::TypeMismatch(format!(
                    "cannot access property '{}' on {}",
                    prop,
                    other.label()
                )))
            }
        };

        self.set(&stmt.name, value);
        Ok(())
    }

    // ===== Aggregates =====

    fn eval_aggr(&mut self) -> DbResult<()> {
        let stmt = self.plan.statements[self.pos].clone();
        self.pos += 1;

        let call = match &stmt.expr {
            Expr::Aggr(call) => call.clone(),
            _ => return Err(DbError::Internal("aggregate payload missing".to_string())),
        };
        let data = self.get_memory(&stmt.sources[0].value)?.clone();
        let result = aggr::apply(&call, stmt.meta_str("input_type"), &data)?;

        self.set(&stmt.name, result);
        Ok(())
    }
}

enum Operand {
    Num(f64),
    Str(String),
    NumList(Vec<f64>),
    StrList(Vec<String>),
    Other(&'static str),
}

impl Operand {
    fn kind(&self) -> &'static str {
        match self {
            Operand::Num(_) => "NUMBER",
            Operand::Str(_) => "STRING",
            Operand::NumList(_) => "ARRAY_OF_NUMBER",
            Operand::StrList(_) => "ARRAY_OF_STRING",
            Operand::Other(label) => label,
        }
    }
}

enum FilterToken {
    /// Equality predicate: (physical column, stringified value).
    Predicate(String, String),
    /// true = and (intersection), false = or (union).
    Connective(bool),
}

/// Replaces `$1..$n` placeholders with the request's context values,
/// quoting each value unless already quoted.
fn substitute_context(query: &str, values: &[String]) -> String {
    let mut out = query.to_string();
    for (i, value) in values.iter().enumerate() {
        let replacement = if value.starts_with('"') && value.ends_with('"') && value.len() >= 2 {
            value.clone()
        } else {
            format!("\"{}\"", value)
        };
        out = out.replacen(&format!("${}", i + 1), &replacement, 1);
    }
    out
}

fn dedupe(items: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    items.into_iter().filter(|x| seen.insert(x.clone())).collect()
}

fn union(a: &[String], b: &[String]) -> Vec<String> {
    let mut out = a.to_vec();
    let seen: HashSet<&String> = a.iter().collect();
    for x in b {
        if !seen.contains(x) {
            out.push(x.clone());
        }
    }
    out
}

fn intersect(a: &[String], b: &[String]) -> Vec<String> {
    let set: HashSet<&String> = a.iter().collect();
    let mut seen = HashSet::new();
    b.iter()
        .filter(|x| set.contains(x) && seen.insert((*x).clone()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_substitute_context() {
        assert_eq!(
            substitute_context("shop.items[owner = $1]", &["alice".to_string()]),
            "shop.items[owner = \"alice\"]"
        );
        assert_eq!(
            substitute_context("t.u[a = $1 and b = $2]", &["\"x\"".to_string(), "y".to_string()]),
            "t.u[a = \"x\" and b = \"y\"]"
        );
    }

    #[test]
    fn test_set_helpers() {
        let a = vec!["1".to_string(), "2".to_string()];
        let b = vec!["2".to_string(), "3".to_string()];
        assert_eq!(union(&a, &b), vec!["1", "2", "3"]);
        assert_eq!(intersect(&a, &b), vec!["2"]);
        assert_eq!(
            dedupe(vec!["a".to_string(), "a".to_string(), "b".to_string()]),
            vec!["a", "b"]
        );
    }
}
