pub mod child_resources;
pub mod handler;
pub mod helpers;
pub mod odoo_instance;
pub mod pipeline;
pub mod state_machine;
pub mod upgrade_job;
