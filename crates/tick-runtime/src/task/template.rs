use chrono::Utc;

use crate::model::{ApiError, ApiResult, Template, valid_id};

use super::TaskManager;

impl TaskManager {
    // -- template CRUD ------------------------------------------------------

    pub async fn create_template(&self, id: &str, script: &str) -> ApiResult<Template> {
        if !valid_id(id) {
            return Err(ApiError::Validation(format!(
                "invalid template id {id:?}: must match [A-Za-z0-9._-]+"
            )));
        }
        let mut reg = self.inner.lock().await;
        if reg.templates.contains_key(id) {
            return Err(ApiError::Conflict(format!(
                "template already exists: {id}"
            )));
        }
        // Templates only need to parse; free variables are bound per task.
        tick_lang::parse_program(script).map_err(|e| ApiError::Validation(e.to_string()))?;

        let now = Utc::now();
        let template = Template {
            id: id.to_string(),
            script: script.to_string(),
            created: now,
            modified: now,
        };
        self.store
            .put(&format!("templates/{id}"), &template)
            .map_err(ApiError::Internal)?;
        reg.templates.insert(id.to_string(), template.clone());
        Ok(template)
    }

    pub async fn get_template(&self, id: &str) -> Option<Template> {
        self.inner.lock().await.templates.get(id).cloned()
    }

    pub async fn list_templates(&self) -> Vec<Template> {
        let reg = self.inner.lock().await;
        let mut out: Vec<Template> = reg.templates.values().cloned().collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub async fn delete_template(&self, id: &str) -> ApiResult<()> {
        let mut reg = self.inner.lock().await;
        if !reg.templates.contains_key(id) {
            return Err(ApiError::NotFound(format!("no template exists: {id}")));
        }
        let dependents: Vec<&str> = reg
            .tasks
            .values()
            .filter(|e| e.record.template_id.as_deref() == Some(id))
            .map(|e| e.record.id.as_str())
            .collect();
        if !dependents.is_empty() {
            return Err(ApiError::Conflict(format!(
                "template {id} is used by {} task(s)",
                dependents.len()
            )));
        }
        reg.templates.remove(id);
        self.store
            .delete(&format!("templates/{id}"))
            .map_err(ApiError::Internal)?;
        Ok(())
    }

    // -- update with all-or-nothing re-instantiation ------------------------

    /// Update a template's script, re-instantiating every dependent task.
    ///
    /// All dependents are recompiled against the new script first; the
    /// first failure aborts the whole update, leaving the template and
    /// every task on the old script.
    pub async fn update_template(&self, id: &str, new_script: &str) -> ApiResult<Template> {
        let mut reg = self.inner.lock().await;
        if !reg.templates.contains_key(id) {
            return Err(ApiError::NotFound(format!("no template exists: {id}")));
        }
        tick_lang::parse_program(new_script).map_err(|e| ApiError::Validation(e.to_string()))?;

        let dependent_ids: Vec<String> = {
            let mut ids: Vec<String> = reg
                .tasks
                .values()
                .filter(|e| e.record.template_id.as_deref() == Some(id))
                .map(|e| e.record.id.clone())
                .collect();
            ids.sort();
            ids
        };

        // Phase 1: compile every dependent; abort on the first failure.
        let mut compiled = Vec::with_capacity(dependent_ids.len());
        for tid in &dependent_ids {
            let entry = reg.tasks.get(tid).expect("dependent present");
            match Self::compile_script(new_script, &entry.record.vars) {
                Ok(dag) => compiled.push((tid.clone(), dag)),
                Err(e) => {
                    return Err(ApiError::Validation(format!(
                        "error reloading associated task {tid}: {e}"
                    )));
                }
            }
        }

        // Phase 2: swap atomically — persist the template, then move each
        // task to the new compiled DAG (restarting the running ones).
        let template = {
            let t = reg.templates.get_mut(id).expect("present");
            t.script = new_script.to_string();
            t.modified = Utc::now();
            t.clone()
        };
        self.store
            .put(&format!("templates/{id}"), &template)
            .map_err(ApiError::Internal)?;

        for (tid, dag) in compiled {
            let Some(mut entry) = reg.tasks.remove(&tid) else {
                continue;
            };
            let was_running = entry.exec.is_some();
            if was_running {
                self.stop_entry(&tid, &mut entry).await;
            }
            entry.record.script = new_script.to_string();
            entry.record.modified = Utc::now();
            entry.dag = std::sync::Arc::new(dag);
            if was_running && let Err(e) = self.start_entry(&mut entry) {
                entry.record.error = e.to_string();
            }
            self.persist(&entry.record)?;
            reg.tasks.insert(tid, entry);
        }
        self.refresh_snapshot(&reg);
        Ok(template)
    }

    /// Rename a template, updating every dependent task's binding. Scripts
    /// are untouched.
    pub async fn rename_template(&self, id: &str, new_id: &str) -> ApiResult<Template> {
        if !valid_id(new_id) {
            return Err(ApiError::Validation(format!(
                "invalid template id {new_id:?}"
            )));
        }
        let mut reg = self.inner.lock().await;
        if !reg.templates.contains_key(id) {
            return Err(ApiError::NotFound(format!("no template exists: {id}")));
        }
        if reg.templates.contains_key(new_id) {
            return Err(ApiError::Conflict(format!("name conflict: {new_id}")));
        }

        let mut template = reg.templates.remove(id).expect("present");
        template.id = new_id.to_string();
        template.modified = Utc::now();
        self.store
            .put(&format!("templates/{new_id}"), &template)
            .map_err(ApiError::Internal)?;
        self.store
            .delete(&format!("templates/{id}"))
            .map_err(ApiError::Internal)?;
        reg.templates.insert(new_id.to_string(), template.clone());

        let dependents: Vec<String> = reg
            .tasks
            .values()
            .filter(|e| e.record.template_id.as_deref() == Some(id))
            .map(|e| e.record.id.clone())
            .collect();
        for tid in dependents {
            if let Some(entry) = reg.tasks.get_mut(&tid) {
                entry.record.template_id = Some(new_id.to_string());
                entry.record.modified = Utc::now();
                self.persist(&entry.record)?;
            }
        }
        self.refresh_snapshot(&reg);
        Ok(template)
    }
}
