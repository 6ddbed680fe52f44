//! DDL dispatch onto the system manager.

use super::ExecuteResult;
use crate::errors::DbResult;
use crate::plan::DdlPlan;
use crate::system::SystemManager;

pub fn execute_ddl(plan: &DdlPlan, sm: &mut SystemManager) -> DbResult<ExecuteResult> {
    match plan {
        DdlPlan::CreateTable { name, cols } => sm.create_table(name, cols)?,
        DdlPlan::DropTable { name } => sm.drop_table(name)?,
        DdlPlan::CreateIndex { table, cols } => sm.create_index(table, cols)?,
        DdlPlan::DropIndex { table, cols } => sm.drop_index(table, cols)?,
    }
    Ok(ExecuteResult::Ddl)
}
