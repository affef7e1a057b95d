//! SQL for database users at each permission level. Cluster statements run
//! against `postgres`, the rest inside the database itself.

use crate::db::Permission;
use crate::gateway::shell::{sql_ident, sql_literal};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantScript {
    pub cluster: Vec<String>,
    pub database: Vec<String>,
}

/// `CREATE ROLE` for a login user. The password is a secret; callers send
/// this through a sensitive command.
pub fn create_role(username: &str, password: &str) -> String {
    format!(
        "CREATE ROLE {} LOGIN PASSWORD {}",
        sql_ident(username),
        sql_literal(password)
    )
}

pub fn grant_script(database: &str, username: &str, permission: Permission) -> GrantScript {
    let db = sql_ident(database);
    let user = sql_ident(username);

    if permission == Permission::NoAccess {
        return GrantScript {
            cluster: vec![format!("REVOKE ALL PRIVILEGES ON DATABASE {db} FROM {user}")],
            database: vec![
                format!("REVOKE ALL PRIVILEGES ON ALL TABLES IN SCHEMA public FROM {user}"),
                format!("REVOKE ALL PRIVILEGES ON ALL SEQUENCES IN SCHEMA public FROM {user}"),
                format!("REVOKE ALL PRIVILEGES ON SCHEMA public FROM {user}"),
            ],
        };
    }

    let (tables, sequences) = match permission {
        Permission::ReadWrite => ("SELECT, INSERT, UPDATE, DELETE", "SELECT, UPDATE"),
        _ => ("SELECT", "SELECT"),
    };
    GrantScript {
        cluster: vec![
            format!("REVOKE ALL ON DATABASE {db} FROM {user}"),
            format!("GRANT CONNECT ON DATABASE {db} TO {user}"),
        ],
        database: vec![
            format!("REVOKE ALL ON SCHEMA public FROM {user}"),
            format!("GRANT USAGE ON SCHEMA public TO {user}"),
            format!("GRANT {tables} ON ALL TABLES IN SCHEMA public TO {user}"),
            format!("GRANT {sequences} ON ALL SEQUENCES IN SCHEMA public TO {user}"),
            format!("ALTER DEFAULT PRIVILEGES IN SCHEMA public GRANT {tables} ON TABLES TO {user}"),
            format!(
                "ALTER DEFAULT PRIVILEGES IN SCHEMA public GRANT {sequences} ON SEQUENCES TO {user}"
            ),
        ],
    }
}
