pub mod odoo_instance;
