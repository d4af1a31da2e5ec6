pub mod randomizer;
