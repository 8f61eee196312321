use std::collections::HashMap;

use super::lexer::{tokenize, Token, TokenKind};
use super::stmt::{AggrCall, Expr, Operation, Plan, Source, Statement};
use crate::db::Db;
use crate::error::{DbError, DbResult};

/// Aggregate input→output type table. Inputs are the structural labels the
/// lowerer can prove statically; outputs drive further identifier
/// resolution after the aggregate.
fn aggr_return(name: &str, input: &str) -> Option<&'static str> {
    let table: &[(&str, &str)] = match name {
        "_sum" | "_count" | "_avg" | "_min" | "_max" => {
            &[("LIST", "NUMBER"), ("TABLE", "NUMBER"), ("JSON", "NUMBER")]
        }
        "_unique" | "_asc" | "_desc" => {
            &[("LIST", "LIST"), ("TABLE", "TABLE"), ("JSON", "LIST")]
        }
        "_date" => &[
            ("LIST", "STRING"),
            ("FIELD", "STRING"),
            ("NUMBER", "STRING"),
            ("TABLE", "STRING"),
            ("JSON", "STRING"),
        ],
        "_like" => &[
            ("FIELD", "BOOL"),
            ("STRING", "BOOL"),
            ("LIST", "BOOL"),
            ("TABLE", "BOOL"),
            ("JSON", "BOOL"),
        ],
        _ => return None,
    };
    table.iter().find(|(i, _)| *i == input).map(|(_, o)| *o)
}

pub fn is_aggr(name: &str) -> bool {
    matches!(
        name,
        "_sum" | "_count" | "_avg" | "_min" | "_max" | "_unique" | "_asc" | "_desc" | "_date" | "_like"
    )
}

fn operator_precedence(kind: TokenKind) -> u8 {
    match kind {
        TokenKind::Star | TokenKind::Slash | TokenKind::Percent => 4,
        TokenKind::Plus | TokenKind::Minus => 3,
        TokenKind::Gt
        | TokenKind::Lt
        | TokenKind::Ge
        | TokenKind::Le
        | TokenKind::Ne
        | TokenKind::In
        | TokenKind::Eq => 2,
        TokenKind::And | TokenKind::Or | TokenKind::Not => 1,
        _ => 0,
    }
}

/// Lowers a query to its linear statement program, resolving identifiers
/// through the protocol named by `password`.
pub fn parse(db: &Db, password: &str, query: &str) -> DbResult<Plan> {
    let tokens = tokenize(query)?;
    let mut parser = Parser {
        db,
        password,
        tokens,
        pos: 0,
        plan: Plan::new(),
    };
    while parser.peek().is_some() {
        parser.parse_statement()?;
    }
    Ok(parser.plan)
}

struct Parser<'a> {
    db: &'a Db,
    password: &'a str,
    tokens: Vec<Token>,
    pos: usize,
    plan: Plan,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> DbResult<Token> {
        match self.advance() {
            Some(token) if token.kind == kind => Ok(token),
            Some(token) => Err(DbError::parse(
                token.pos,
                format!("expect {} but got '{}'", what, token.value),
            )),
            None => Err(DbError::parse(
                self.tokens.len(),
                format!("expect {} but got end of query", what),
            )),
        }
    }

    fn parse_statement(&mut self) -> DbResult<()> {
        let token = match self.peek() {
            Some(token) => token.clone(),
            None => return Ok(()),
        };

        match token.kind {
            TokenKind::Dot => {
                self.advance();
                Ok(())
            }
            TokenKind::Str | TokenKind::Number => {
                let stmt = self.parse_literal()?;
                self.plan.push(stmt)?;
                Ok(())
            }
            TokenKind::Ident => {
                let stmt = self.parse_identifier()?;
                self.plan.push(stmt)?;
                Ok(())
            }
            TokenKind::RowAccess => {
                let stmt = self.parse_row_access()?;
                self.plan.push(stmt)?;
                Ok(())
            }
            TokenKind::Slice => {
                let stmt = self.parse_slice()?;
                self.plan.push(stmt)?;
                Ok(())
            }
            TokenKind::LBracket => self.parse_filter(),
            TokenKind::LBrace => self.parse_projection(),
            TokenKind::LParen => self.parse_parenthesis(),
            _ if operator_precedence(token.kind) > 0 => self.parse_operator(),
            _ => Err(DbError::parse(
                token.pos,
                format!("unexpected token '{}'", token.value),
            )),
        }
    }

    // ===== Literals, row access, slices =====

    fn parse_literal(&mut self) -> DbResult<Statement> {
        let token = self.advance().expect("peeked");
        let mut stmt = Statement::new(Operation::Literal);
        stmt.expr = Expr::Text(token.value);
        let kind = if token.kind == TokenKind::Number {
            "NUMBER"
        } else {
            "STRING"
        };
        stmt.meta.insert("type".to_string(), kind.to_string());
        Ok(stmt)
    }

    fn parse_row_access(&mut self) -> DbResult<Statement> {
        let token = self.advance().expect("peeked");
        let index: i64 = token
            .value
            .parse()
            .map_err(|_| DbError::parse(token.pos, format!("invalid row number '{}'", token.value)))?;
        let prev = self.last_statement_name(token.pos)?;
        let mut stmt = Statement::new(Operation::AccessRow);
        stmt.expr = Expr::Index(index);
        stmt.sources.push(Source::var(prev));
        Ok(stmt)
    }

    fn parse_slice(&mut self) -> DbResult<Statement> {
        let token = self.advance().expect("peeked");
        let prev = self.last_statement_name(token.pos)?;
        let mut stmt = Statement::new(Operation::Slice);
        stmt.expr = Expr::Text(token.value);
        stmt.sources.push(Source::var(prev));
        Ok(stmt)
    }

    fn last_statement_name(&self, at: usize) -> DbResult<String> {
        self.plan
            .last()
            .map(|s| s.name.clone())
            .ok_or_else(|| DbError::parse(at, "expression has no preceding statement"))
    }

    // ===== Identifier resolution =====

    fn parse_identifier(&mut self) -> DbResult<Statement> {
        let token = self.peek().expect("peeked").clone();

        if self.plan.statements.is_empty() {
            return self.parse_access_table();
        }
        if self.db.is_database(self.password, &token.value) {
            return self.parse_access_table();
        }

        let prev = self.prev_statement(token.pos)?;
        if token.value == "parent" {
            return self.parse_parent_keyword();
        }

        let table_like = prev.meta_str("return_type") == "TABLE"
            || matches!(
                prev.op,
                Operation::AccessTable
                    | Operation::AccessRelatedTable
                    | Operation::StartFilter
                    | Operation::EndFilter
                    | Operation::Slice
                    | Operation::StartProjectionKey
                    | Operation::EndProjectionKey
                    | Operation::EndProjection
            );
        if table_like {
            return self.parse_identifier_after_table(prev);
        }

        if matches!(
            prev.op,
            Operation::AccessList
                | Operation::AccessRow
                | Operation::AccessField
                | Operation::AccessJsonProperty
                | Operation::UnknownIdentifier
                | Operation::Aggregate
        ) {
            return self.parse_identifier_after_value(prev);
        }

        Err(DbError::parse(
            token.pos,
            format!("unexpected identifier '{}' after {}", token.value, prev.op.tag()),
        ))
    }

    /// The statement the next identifier chains onto: the last statement
    /// when it is chainable, otherwise the innermost open scope.
    fn prev_statement(&self, at: usize) -> DbResult<Statement> {
        if let Some(last) = self.plan.last() {
            let chainable = matches!(
                last.op,
                Operation::AccessTable
                    | Operation::AccessRelatedTable
                    | Operation::StartFilter
                    | Operation::EndFilter
                    | Operation::Slice
                    | Operation::StartProjectionKey
                    | Operation::EndProjectionKey
                    | Operation::EndProjection
                    | Operation::AccessList
                    | Operation::AccessRow
                    | Operation::AccessField
                    | Operation::AccessJsonProperty
                    | Operation::UnknownIdentifier
                    | Operation::Aggregate
            );
            if chainable {
                return Ok(last.clone());
            }
        }
        if let Some(&parent) = self.plan.parents.last() {
            return Ok(self.plan.statements[parent].clone());
        }
        Err(DbError::parse(at, "no previous statement found"))
    }

    fn parse_access_table(&mut self) -> DbResult<Statement> {
        let db_token = self.expect(TokenKind::Ident, "database")?;
        if !self.db.is_database(self.password, &db_token.value) {
            return Err(DbError::parse(
                db_token.pos,
                format!("expect database but got '{}'", db_token.value),
            ));
        }
        self.expect(TokenKind::Dot, "'.'")?;
        let table_token = self.expect(TokenKind::Ident, "table")?;
        if !self.db.is_table(self.password, &db_token.value, &table_token.value) {
            return Err(DbError::parse(
                table_token.pos,
                format!("expect table but got '{}'", table_token.value),
            ));
        }

        let mut stmt = Statement::new(Operation::AccessTable);
        stmt.sources
            .push(Source::db(format!("{}.{}", db_token.value, table_token.value)));
        stmt.meta.insert(
            "db".to_string(),
            self.db.db_name_from_proto(self.password, &db_token.value)?,
        );
        stmt.meta.insert(
            "table".to_string(),
            self.db
                .table_name_from_proto(self.password, &db_token.value, &table_token.value)?,
        );
        Ok(stmt)
    }

    fn parse_access_related_table(
        &mut self,
        db_alias: &str,
        parent_table: &str,
        var_dependency: &str,
    ) -> DbResult<Statement> {
        let token = self.expect(TokenKind::Ident, "relation")?;
        let relation = self
            .db
            .relation(self.password, db_alias, parent_table, &token.value)
            .map_err(|_| {
                DbError::parse(
                    token.pos,
                    format!("no relation '{}' on table '{}'", token.value, parent_table),
                )
            })?;

        let mut stmt = Statement::new(Operation::AccessRelatedTable);
        stmt.sources
            .push(Source::db(format!("{}.{}", db_alias, relation.prototable)));
        stmt.sources.push(Source::var(var_dependency));
        stmt.meta.insert(
            "db".to_string(),
            self.db.db_name_from_proto(self.password, db_alias)?,
        );
        stmt.meta.insert("table".to_string(), relation.entity.clone());
        stmt.expr = Expr::Relation(relation);
        Ok(stmt)
    }

    fn parse_identifier_after_table(&mut self, prev: Statement) -> DbResult<Statement> {
        let token = self.peek().expect("peeked").clone();
        let ancestor = self.plan.ancestor_table(self.plan.by_name(&prev.name).unwrap())?;
        let source = ancestor.sources[0].value.clone();
        let (db_alias, table_alias) = split_db_table(&source, token.pos)?;

        if self.db.is_relation(self.password, &db_alias, &table_alias, &token.value) {
            return self.parse_access_related_table(&db_alias, &table_alias, &prev.name);
        }
        if self.db.is_column(self.password, &db_alias, &table_alias, &token.value) {
            return self.parse_column(&db_alias, &table_alias, &prev.name, Operation::AccessList);
        }
        if is_aggr(&token.value) {
            return self.parse_aggr(&prev.name);
        }
        Err(DbError::parse(
            token.pos,
            format!("unknown identifier '{}' after table data", token.value),
        ))
    }

    fn parse_identifier_after_value(&mut self, prev: Statement) -> DbResult<Statement> {
        let token = self.peek().expect("peeked").clone();

        // An aggregate result chains as whatever shape it returned.
        let effective = if prev.op == Operation::Aggregate {
            match prev.meta_str("return_type") {
                "TABLE" => Operation::AccessTable,
                "LIST" => Operation::AccessList,
                "FIELD" => Operation::AccessField,
                "ROW" => Operation::AccessRow,
                "NUMBER" | "STRING" => Operation::Literal,
                _ => Operation::UnknownIdentifier,
            }
        } else {
            prev.op
        };

        match effective {
            Operation::AccessList => {
                if is_aggr(&token.value) {
                    self.parse_aggr(&prev.name)
                } else {
                    self.parse_json_property(&prev)
                }
            }
            Operation::AccessRow => {
                let ancestor = self.plan.ancestor_table(self.plan.by_name(&prev.name).unwrap())?;
                let source = ancestor.sources[0].value.clone();
                let (db_alias, table_alias) = split_db_table(&source, token.pos)?;
                if self.db.is_column(self.password, &db_alias, &table_alias, &token.value) {
                    self.parse_column(&db_alias, &table_alias, &prev.name, Operation::AccessField)
                } else if self.db.is_relation(self.password, &db_alias, &table_alias, &token.value) {
                    self.parse_access_related_table(&db_alias, &table_alias, &prev.name)
                } else if is_aggr(&token.value) {
                    self.parse_aggr(&prev.name)
                } else {
                    Err(DbError::parse(
                        token.pos,
                        format!("expect field or aggregate but got '{}'", token.value),
                    ))
                }
            }
            Operation::AccessField
            | Operation::AccessJsonProperty
            | Operation::UnknownIdentifier => {
                if is_aggr(&token.value) {
                    self.parse_aggr(&prev.name)
                } else {
                    self.parse_json_property(&prev)
                }
            }
            _ => Err(DbError::parse(
                token.pos,
                format!("unexpected identifier '{}' after scalar value", token.value),
            )),
        }
    }

    fn parse_column(
        &mut self,
        db_alias: &str,
        table_alias: &str,
        dependency: &str,
        op: Operation,
    ) -> DbResult<Statement> {
        let token = self.expect(TokenKind::Ident, "column")?;
        if !self.db.is_column(self.password, db_alias, table_alias, &token.value) {
            return Err(DbError::parse(
                token.pos,
                format!("expect column but got '{}'", token.value),
            ));
        }
        let mut stmt = Statement::new(op);
        stmt.sources.push(Source::var(dependency));
        stmt.expr = Expr::Text(token.value.clone());
        stmt.meta =
            self.db
                .col_schema_from_proto(self.password, db_alias, table_alias, &token.value)?;
        Ok(stmt)
    }

    fn parse_json_property(&mut self, prev: &Statement) -> DbResult<Statement> {
        let token = self.expect(TokenKind::Ident, "identifier")?;

        let json_parent = prev.meta_str("type") == "json"
            || prev.op == Operation::AccessJsonProperty
            || (prev.op == Operation::Aggregate && prev.meta_str("return_type") == "JSON");

        let mut stmt = Statement::new(if json_parent {
            Operation::AccessJsonProperty
        } else {
            Operation::UnknownIdentifier
        });
        stmt.meta
            .insert("property_name".to_string(), token.value.clone());
        stmt.meta.insert(
            "type".to_string(),
            if json_parent { "json" } else { "unknown" }.to_string(),
        );
        stmt.sources.push(Source::var(&prev.name));
        stmt.expr = Expr::Text(token.value);
        Ok(stmt)
    }

    /// `parent` inside a nested filter/projection reads the enclosing
    /// scope's row context.
    fn parse_parent_keyword(&mut self) -> DbResult<Statement> {
        let token = self.expect(TokenKind::Ident, "'parent'")?;
        if self.plan.parents.len() < 2 {
            return Err(DbError::parse(token.pos, "no parent scope found"));
        }
        let parent_idx = self.plan.parents[self.plan.parents.len() - 2];
        let parent_name = self.plan.statements[parent_idx].name.clone();
        let ancestor = self
            .plan
            .ancestor_table(&self.plan.statements[parent_idx])?;
        let source = ancestor.sources[0].value.clone();
        let (db_alias, table_alias) = split_db_table(&source, token.pos)?;

        self.expect(TokenKind::Dot, "'.'")?;
        let col = self.expect(TokenKind::Ident, "identifier")?;
        let meta =
            self.db
                .col_schema_from_proto(self.password, &db_alias, &table_alias, &col.value)?;

        let mut stmt = Statement::new(Operation::AccessList);
        stmt.sources.push(Source::var(parent_name));
        stmt.expr = Expr::Text(col.value);
        stmt.meta = meta;
        Ok(stmt)
    }

    // ===== Aggregates =====

    fn parse_aggr(&mut self, dependency: &str) -> DbResult<Statement> {
        let token = self.expect(TokenKind::Ident, "aggregate")?;
        if !is_aggr(&token.value) {
            return Err(DbError::parse(
                token.pos,
                format!("unknown aggregate function '{}'", token.value),
            ));
        }

        let input_type = self.aggr_input_type(dependency)?;
        let return_type = aggr_return(&token.value, &input_type).ok_or_else(|| {
            DbError::parse(
                token.pos,
                format!(
                    "aggregate function '{}' does not support input type '{}'",
                    token.value, input_type
                ),
            )
        })?;

        let mut stmt = Statement::new(Operation::Aggregate);
        stmt.sources.push(Source::var(dependency));
        stmt.meta.insert("input_type".to_string(), input_type);
        stmt.meta
            .insert("return_type".to_string(), return_type.to_string());

        let mut call = AggrCall {
            name: token.value,
            args: Vec::new(),
        };
        if self.peek().map(|t| t.kind) == Some(TokenKind::LParen) {
            self.advance();
            loop {
                let arg = match self.advance() {
                    Some(token) => token,
                    None => {
                        return Err(DbError::parse(
                            self.tokens.len(),
                            "expect ')' but got end of query",
                        ))
                    }
                };
                match arg.kind {
                    TokenKind::RParen => break,
                    TokenKind::Comma => continue,
                    TokenKind::Ident | TokenKind::Number | TokenKind::Str => {
                        call.args.push(arg.value)
                    }
                    _ => {
                        return Err(DbError::parse(
                            arg.pos,
                            format!("expect identifier, number or string but got '{}'", arg.value),
                        ))
                    }
                }
            }
        }
        stmt.expr = Expr::Aggr(call);
        Ok(stmt)
    }

    /// Structural label of an aggregate's input statement. Slices keep the
    /// shape of what they sliced.
    fn aggr_input_type(&self, name: &str) -> DbResult<String> {
        let stmt = self
            .plan
            .by_name(name)
            .ok_or_else(|| DbError::Internal(format!("unresolved statement '{}'", name)))?;
        let label = match stmt.op {
            Operation::AccessTable
            | Operation::AccessRelatedTable
            | Operation::EndFilter
            | Operation::EndProjection => "TABLE".to_string(),
            Operation::AccessList => "LIST".to_string(),
            Operation::AccessField => "FIELD".to_string(),
            Operation::AccessRow => "ROW".to_string(),
            Operation::AccessJsonProperty => "JSON".to_string(),
            Operation::Literal => "NUMBER".to_string(),
            Operation::Aggregate => stmt.meta_str("return_type").to_string(),
            Operation::Slice => {
                let source = stmt.sources[0].value.clone();
                self.aggr_input_type(&source)?
            }
            Operation::UnknownIdentifier => {
                return Err(DbError::TypeMismatch(
                    "cannot aggregate an unresolved property".to_string(),
                ))
            }
            _ => "UNKNOWN".to_string(),
        };
        Ok(label)
    }

    // ===== Blocks =====

    fn parse_filter(&mut self) -> DbResult<()> {
        let open = self.expect(TokenKind::LBracket, "'['")?;
        let bound = self.last_statement_name(open.pos)?;

        let mut start = Statement::new(Operation::StartFilter);
        start.sources.push(Source::var(&bound));
        self.plan.push(start)?;

        loop {
            match self.peek() {
                None => {
                    return Err(DbError::parse(self.tokens.len(), "expect ']' but got end of query"))
                }
                Some(token) if token.kind == TokenKind::RBracket => {
                    self.advance();
                    break;
                }
                Some(_) => self.parse_statement()?,
            }
        }

        let mut end = Statement::new(Operation::EndFilter);
        end.sources.push(Source::var(&bound));
        self.plan.push(end)?;
        Ok(())
    }

    fn parse_projection(&mut self) -> DbResult<()> {
        let open = self.expect(TokenKind::LBrace, "'{'")?;
        let bound = self.last_statement_name(open.pos)?;

        let mut start = Statement::new(Operation::StartProjection);
        start.sources.push(Source::var(&bound));
        let projection_name = self.plan.push(start)?;

        loop {
            let token = match self.advance() {
                None => {
                    return Err(DbError::parse(self.tokens.len(), "expect '}' but got end of query"))
                }
                Some(token) => token,
            };
            match token.kind {
                TokenKind::RBrace => break,
                TokenKind::Comma => continue,
                TokenKind::Str => {
                    self.expect(TokenKind::Colon, "':'")?;
                    self.parse_projection_key(&projection_name, token.value)?;
                }
                TokenKind::Ident => {
                    if self.peek().map(|t| t.kind) == Some(TokenKind::Colon) {
                        self.advance();
                    } else {
                        // Shorthand `{col}`: the key expression is the
                        // identifier itself.
                        self.pos -= 1;
                    }
                    self.parse_projection_key(&projection_name, token.value)?;
                }
                _ => {
                    return Err(DbError::parse(
                        token.pos,
                        format!("expect string or identifier but got '{}'", token.value),
                    ))
                }
            }
        }

        let mut end = Statement::new(Operation::EndProjection);
        end.sources.push(Source::var(&bound));
        self.plan.push(end)?;
        Ok(())
    }

    fn parse_projection_key(&mut self, projection_name: &str, key: String) -> DbResult<()> {
        let mut start = Statement::new(Operation::StartProjectionKey);
        start.sources.push(Source::var(projection_name));
        start.expr = Expr::Text(key.clone());
        self.plan.push(start)?;

        loop {
            match self.peek() {
                None => {
                    return Err(DbError::parse(self.tokens.len(), "expect '}' but got end of query"))
                }
                Some(token)
                    if token.kind == TokenKind::RBrace || token.kind == TokenKind::Comma =>
                {
                    break;
                }
                Some(_) => self.parse_statement()?,
            }
        }

        let mut end = Statement::new(Operation::EndProjectionKey);
        end.sources.push(Source::var(projection_name));
        end.expr = Expr::Text(key);
        self.plan.push(end)?;
        Ok(())
    }

    fn parse_parenthesis(&mut self) -> DbResult<()> {
        self.expect(TokenKind::LParen, "'('")?;
        loop {
            match self.peek() {
                None => {
                    return Err(DbError::parse(self.tokens.len(), "expect ')' but got end of query"))
                }
                Some(token) if token.kind == TokenKind::RParen => {
                    self.advance();
                    return Ok(());
                }
                Some(_) => self.parse_statement()?,
            }
        }
    }

    // ===== Operators =====

    /// Pops the previous statement as the left operand (except for unary
    /// `not`), parses the right-hand side until a lower-precedence operator
    /// or a closing token, and emits one `NO` statement whose expression is
    /// the literal "left op right" text.
    fn parse_operator(&mut self) -> DbResult<()> {
        let op_token = self.advance().expect("peeked");
        let precedence = operator_precedence(op_token.kind);
        if precedence == 0 {
            return Err(DbError::parse(
                op_token.pos,
                format!("expect operator but got '{}'", op_token.value),
            ));
        }

        let mut left = String::new();
        let mut left_type = String::new();
        if op_token.kind != TokenKind::Not {
            let prev = self.plan.last().ok_or_else(|| {
                DbError::parse(op_token.pos, "operator has no left operand")
            })?;
            left = prev.name.clone();
            left_type = "var".to_string();
        }

        loop {
            let token = match self.peek() {
                Some(token) => token.clone(),
                None => break,
            };
            let next_precedence = operator_precedence(token.kind);
            if next_precedence == 0 {
                if matches!(
                    token.kind,
                    TokenKind::RParen | TokenKind::RBracket | TokenKind::Comma | TokenKind::RBrace
                ) {
                    break;
                }
                self.parse_statement()?;
            } else if precedence > next_precedence {
                break;
            } else {
                self.parse_statement()?;
                break;
            }
        }

        let right = self
            .plan
            .last()
            .map(|s| s.name.clone())
            .ok_or_else(|| DbError::parse(op_token.pos, "operator has no right operand"))?;

        let mut stmt = Statement::new(Operation::Operator);
        stmt.expr = Expr::Text(format!("{} {} {}", left, op_token.value, right));
        if !left.is_empty() {
            stmt.sources.push(Source::var(&left));
        }
        stmt.sources.push(Source::var(&right));
        stmt.meta = HashMap::from([
            ("left_type".to_string(), left_type),
            ("right_type".to_string(), "var".to_string()),
        ]);
        self.plan.push(stmt)?;
        Ok(())
    }
}

fn split_db_table(source: &str, at: usize) -> DbResult<(String, String)> {
    source
        .split_once('.')
        .map(|(db, table)| (db.to_string(), table.to_string()))
        .ok_or_else(|| DbError::parse(at, format!("malformed table reference '{}'", source)))
}
